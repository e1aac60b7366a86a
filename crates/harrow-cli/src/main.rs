use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harrow_client::{CssExtractor, ReqwestFetcher, TableProxySource};
use harrow_core::config::{CrawlConfig, RetryPolicy};
use harrow_core::fetch::RotatingFetcher;
use harrow_core::models::{FieldRules, SelectionPolicy};
use harrow_core::orchestrator::Orchestrator;
use harrow_core::pipeline::{PagePipeline, TargetSite};
use harrow_core::registry::{ProbeTarget, ProxyRegistry};
use harrow_core::throttle::{ThrottleConfig, ThrottledFetcher};
use harrow_core::traits::NoSession;
use harrow_db::{Database, DatabaseConfig, ProxyRepository};

#[derive(Parser)]
#[command(name = "harrow", version, about = "Proxy-rotating page crawler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the page index through rotating proxies
    Crawl(CrawlArgs),

    /// Probe stored proxies and delete the ones that fail
    Verify {
        /// Page every working proxy must return intact
        #[arg(long, env = "HARROW_PROBE_URL", default_value = "https://ya.ru/")]
        probe_url: String,

        /// Text the probe page must contain
        #[arg(long, env = "HARROW_PROBE_MARKER", default_value = "Яндекс")]
        marker: String,

        /// Probes in flight at once
        #[arg(long, default_value_t = 10)]
        concurrency: usize,

        /// Per-probe timeout in seconds
        #[arg(long, default_value_t = 15)]
        timeout: u64,

        /// Repeat every N seconds instead of exiting after one pass
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Scrape public proxy lists into the registry
    Discover {
        #[arg(long, value_enum, default_value_t = SourceKind::All)]
        source: SourceKind,

        /// Repeat every N seconds instead of exiting after one pass
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Return every frozen proxy to rotation
    Unfreeze,

    /// Print proxy pool counts as JSON
    Stats,
}

#[derive(Args)]
struct CrawlArgs {
    /// JSON file with the challenge, link and field selectors
    #[arg(short, long, env = "HARROW_RULES")]
    rules: PathBuf,

    /// Index URL with `{page}` and optional `{page_size}` placeholders
    #[arg(short, long, env = "HARROW_INDEX_URL")]
    index_url: String,

    /// Number of index pages, crawled as `[0, total_pages)`
    #[arg(short, long, env = "HARROW_TOTAL_PAGES")]
    total_pages: u64,

    #[arg(long, env = "HARROW_PAGE_SIZE", default_value_t = 100)]
    page_size: u32,

    #[arg(short, long, env = "HARROW_WORKERS", default_value_t = 4)]
    workers: usize,

    #[arg(long, env = "HARROW_QUEUE_CAPACITY", default_value_t = 80)]
    queue_capacity: usize,

    /// Seconds a worker waits on an empty queue before exiting
    #[arg(long, default_value_t = 20)]
    worker_timeout: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "HARROW_REQUEST_TIMEOUT", default_value_t = 7)]
    request_timeout: u64,

    /// Seconds between passes
    #[arg(long, env = "HARROW_POLL_DELAY", default_value_t = 5)]
    poll_delay: u64,

    #[arg(long, value_enum, env = "HARROW_SELECTION", default_value_t = Selection::Lru)]
    selection: Selection,

    /// Attempts per URL before giving up
    #[arg(long, env = "HARROW_MAX_ATTEMPTS", default_value_t = 10)]
    max_attempts: u32,

    /// Seconds per URL before giving up
    #[arg(long, env = "HARROW_MAX_ELAPSED", default_value_t = 300)]
    max_elapsed: u64,

    /// Fetch without a proxy when none is eligible
    #[arg(long, env = "HARROW_ALLOW_DIRECT", default_value_t = false)]
    allow_direct: bool,

    /// Minimum milliseconds between requests on one proxy and host
    #[arg(long, env = "HARROW_THROTTLE_MS", default_value_t = 0)]
    throttle_ms: u64,

    /// Run a single pass and print its summary
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Selection {
    Lru,
    Random,
}

impl From<Selection> for SelectionPolicy {
    fn from(value: Selection) -> Self {
        match value {
            Selection::Lru => SelectionPolicy::Lru,
            Selection::Random => SelectionPolicy::Random,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// free-proxy-list.net
    Fpl,
    /// ip-adress.com
    Ipa,
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harrow=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = shutdown_token();
    let db = connect_db().await?;

    match cli.command {
        Commands::Crawl(args) => cmd_crawl(args, &db, cancel).await?,
        Commands::Verify {
            probe_url,
            marker,
            concurrency,
            timeout,
            interval,
        } => {
            let probe =
                ProbeTarget::new(probe_url, marker).with_timeout(Duration::from_secs(timeout));
            cmd_verify(&db, &probe, concurrency, interval, &cancel).await?;
        }
        Commands::Discover { source, interval } => {
            cmd_discover(&db, source, interval, &cancel).await?;
        }
        Commands::Unfreeze => {
            let count = registry(&db).unfreeze_all().await?;
            println!("{count}");
        }
        Commands::Stats => {
            let stats = registry(&db).stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            trigger.cancel();
        }
    });
    cancel
}

async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn registry(db: &Database) -> ProxyRegistry<ProxyRepository> {
    ProxyRegistry::new(db.proxy_repo())
}

fn load_rules(path: &Path) -> Result<FieldRules> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
    serde_json::from_str(&raw).context("Invalid JSON in rules file")
}

async fn cmd_crawl(args: CrawlArgs, db: &Database, cancel: CancellationToken) -> Result<()> {
    let rules = load_rules(&args.rules)?;
    let retry = RetryPolicy::default()
        .with_max_attempts(args.max_attempts)
        .with_max_elapsed(Duration::from_secs(args.max_elapsed));
    let config = CrawlConfig::new(args.total_pages)
        .with_page_size(args.page_size)
        .with_workers(args.workers)
        .with_queue_capacity(args.queue_capacity)
        .with_worker_timeout(Duration::from_secs(args.worker_timeout))
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_poll_delay(Duration::from_secs(args.poll_delay))
        .with_selection(args.selection.into())
        .with_retry(retry)
        .with_direct_fallback(args.allow_direct);

    let http = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    let fetcher = ThrottledFetcher::new(
        http,
        ThrottleConfig::new(Duration::from_millis(args.throttle_ms)),
    );

    let rotating = RotatingFetcher::from_config(fetcher, registry(db), &config)
        .with_cancellation(cancel.clone());

    let pipeline = PagePipeline::new(
        rotating,
        CssExtractor::new(),
        db.record_repo(),
        TargetSite::new(args.index_url, rules),
    );
    let orchestrator = Orchestrator::new(pipeline, NoSession, config)?;

    if args.once {
        let summary = orchestrator.run_once(cancel).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        orchestrator.run(cancel).await?;
    }
    Ok(())
}

async fn cmd_verify(
    db: &Database,
    probe: &ProbeTarget,
    concurrency: usize,
    interval: Option<u64>,
    cancel: &CancellationToken,
) -> Result<()> {
    let registry = registry(db);
    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;

    loop {
        let summary = registry.verify_all(&fetcher, probe, concurrency).await?;
        println!("{}", serde_json::to_string(&summary)?);

        let Some(secs) = interval else {
            return Ok(());
        };
        if !sleep_or_cancel(Duration::from_secs(secs), cancel).await {
            return Ok(());
        }
    }
}

async fn cmd_discover(
    db: &Database,
    source: SourceKind,
    interval: Option<u64>,
    cancel: &CancellationToken,
) -> Result<()> {
    let registry = registry(db);
    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    let fpl = TableProxySource::free_proxy_list(fetcher.clone());
    let ipa = TableProxySource::ip_adress(fetcher);

    loop {
        let mut inserted = 0;
        // One failing listing must not stop the other.
        if source != SourceKind::Ipa {
            match registry.discover(&fpl).await {
                Ok(n) => inserted += n,
                Err(e) => tracing::warn!(source = "free-proxy-list.net", error = %e, "Discovery failed"),
            }
        }
        if source != SourceKind::Fpl {
            match registry.discover(&ipa).await {
                Ok(n) => inserted += n,
                Err(e) => tracing::warn!(source = "ip-adress.com", error = %e, "Discovery failed"),
            }
        }
        println!("{inserted}");

        let Some(secs) = interval else {
            return Ok(());
        };
        if !sleep_or_cancel(Duration::from_secs(secs), cancel).await {
            return Ok(());
        }
    }
}

/// Sleep for `delay`; `false` when cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancel.cancelled() => false,
    }
}
