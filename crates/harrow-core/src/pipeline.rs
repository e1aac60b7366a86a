use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::fetch::RotatingFetcher;
use crate::models::{ExtractedRecord, Extraction, FieldRules, UpsertOutcome};
use crate::traits::{Extractor, PageFetcher, ProxyStore, Sink};

/// The paginated site being crawled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSite {
    /// Index page URL with `{page}` and `{page_size}` placeholders.
    pub index_url_template: String,
    pub rules: FieldRules,
}

impl TargetSite {
    pub fn new(index_url_template: impl Into<String>, rules: FieldRules) -> Self {
        Self {
            index_url_template: index_url_template.into(),
            rules,
        }
    }

    pub fn index_url(&self, page: u64, page_size: u32) -> String {
        self.index_url_template
            .replace("{page}", &page.to_string())
            .replace("{page_size}", &page_size.to_string())
    }
}

/// Per-page tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReport {
    pub links: usize,
    pub upserted: usize,
    pub unchanged: usize,
    /// Detail pages dropped on a fatal, non-retryable error.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Marked done by an earlier pass; nothing was fetched.
    AlreadyDone,
    /// Every link was stored or skipped; the page is now marked done.
    Done(PageReport),
    /// At least one link could not be stored; the page stays pending.
    Incomplete { reason: String, report: PageReport },
}

/// Processes one index page: fetch it, follow its detail links, upsert
/// a record per link, then mark the page done.
///
/// Generic over all collaborators so tests run against in-memory stores and
/// scripted fetchers.
#[derive(Clone)]
pub struct PagePipeline<F, S, E, K>
where
    F: PageFetcher,
    S: ProxyStore,
    E: Extractor,
    K: Sink,
{
    fetcher: RotatingFetcher<F, S>,
    extractor: E,
    sink: K,
    site: TargetSite,
}

impl<F, S, E, K> PagePipeline<F, S, E, K>
where
    F: PageFetcher,
    S: ProxyStore + 'static,
    E: Extractor,
    K: Sink,
{
    pub fn new(fetcher: RotatingFetcher<F, S>, extractor: E, sink: K, site: TargetSite) -> Self {
        Self {
            fetcher,
            extractor,
            sink,
            site,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn site(&self) -> &TargetSite {
        &self.site
    }

    /// Process index page `page`.
    ///
    /// Failing to fetch or parse the index page itself is returned as an
    /// error. Failures on individual detail links are contained: fatal ones
    /// are skipped, anything else leaves the page pending for the next pass.
    pub async fn process_page(&self, page: u64, page_size: u32) -> Result<PageOutcome, AppError> {
        if self.sink.is_page_done(page).await? {
            return Ok(PageOutcome::AlreadyDone);
        }

        let index_url = self.site.index_url(page, page_size);
        let links = self
            .fetcher
            .fetch_with(&index_url, |html| {
                match self.extractor.links(html, &index_url, &self.site.rules)? {
                    Extraction::Found(links) => Ok(links),
                    Extraction::ChallengeDetected => Err(AppError::ChallengeDetected {
                        url: index_url.clone(),
                    }),
                }
            })
            .await?
            .value;

        let mut report = PageReport {
            links: links.len(),
            ..Default::default()
        };
        let mut pending: Option<String> = None;

        for link in &links {
            match self.process_link(page, link).await {
                Ok(UpsertOutcome::Unchanged) => report.unchanged += 1,
                Ok(_) => report.upserted += 1,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) if e.is_skippable() => {
                    tracing::warn!(page, %link, error = %e, "Skipping detail page");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(page, %link, error = %e, "Detail page left for next pass");
                    pending.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some(reason) = pending {
            return Ok(PageOutcome::Incomplete { reason, report });
        }

        self.sink.mark_page_done(page, page_size).await?;
        Ok(PageOutcome::Done(report))
    }

    async fn process_link(&self, page: u64, link: &str) -> Result<UpsertOutcome, AppError> {
        let fields = self
            .fetcher
            .fetch_with(link, |html| match self.extractor.extract(html, &self.site.rules)? {
                Extraction::Found(fields) => Ok(fields),
                Extraction::ChallengeDetected => Err(AppError::ChallengeDetected {
                    url: link.to_string(),
                }),
            })
            .await?
            .value;

        self.sink
            .upsert(&ExtractedRecord::new(link, page, fields))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::memory::{MemoryProxyStore, MemorySink};
    use crate::registry::ProxyRegistry;
    use crate::testutil::{MockExtractor, MockFetcher, test_rules};

    type TestPipeline = PagePipeline<MockFetcher, MemoryProxyStore, MockExtractor, MemorySink>;

    const TEMPLATE: &str = "http://site.test/list?page={page}&size={page_size}";

    fn pipeline(fetcher: MockFetcher, sink: MemorySink) -> TestPipeline {
        cancellable_pipeline(fetcher, sink, CancellationToken::new())
    }

    fn cancellable_pipeline(
        fetcher: MockFetcher,
        sink: MemorySink,
        cancel: CancellationToken,
    ) -> TestPipeline {
        let registry = ProxyRegistry::new(MemoryProxyStore::with_endpoints([
            "http://a:1",
            "http://b:1",
            "http://c:1",
            "http://d:1",
            "http://e:1",
        ]));
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        PagePipeline::new(
            RotatingFetcher::new(fetcher, registry, policy).with_cancellation(cancel),
            MockExtractor,
            sink,
            TargetSite::new(TEMPLATE, test_rules()),
        )
    }

    fn index(page: u64) -> String {
        format!("http://site.test/list?page={page}&size=10")
    }

    #[test]
    fn test_index_url_template() {
        let site = TargetSite::new(TEMPLATE, test_rules());
        assert_eq!(
            site.index_url(7, 25),
            "http://site.test/list?page=7&size=25"
        );
    }

    #[tokio::test]
    async fn test_page_is_crawled_and_marked_done() {
        let fetcher = MockFetcher::new("fields:name=Widget")
            .route(&index(1), Ok("links:http://site.test/i/1,http://site.test/i/2".into()));
        let sink = MemorySink::new();
        let outcome = pipeline(fetcher, sink.clone())
            .process_page(1, 10)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PageOutcome::Done(PageReport {
                links: 2,
                upserted: 2,
                unchanged: 0,
                skipped: 0
            })
        );
        assert_eq!(sink.done_pages(), vec![1]);
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.page_ref == 1 && r.completed));
    }

    #[tokio::test]
    async fn test_done_page_is_not_fetched() {
        let fetcher = MockFetcher::new("fields:name=Widget");
        let sink = MemorySink::new();
        sink.mark_page_done(4, 10).await.unwrap();

        let outcome = pipeline(fetcher.clone(), sink)
            .process_page(4, 10)
            .await
            .unwrap();

        assert_eq!(outcome, PageOutcome::AlreadyDone);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_recrawl_is_unchanged() {
        let fetcher = MockFetcher::new("fields:name=Widget")
            .route(&index(1), Ok("links:http://site.test/i/1".into()));
        let sink = MemorySink::new();
        let pipeline = pipeline(fetcher, sink.clone());

        let first = pipeline.process_page(1, 10).await.unwrap();
        assert!(matches!(first, PageOutcome::Done(r) if r.upserted == 1));

        let again = pipeline.process_link(1, "http://site.test/i/1").await.unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_detail_is_skipped() {
        let fetcher = MockFetcher::new("fields:name=Widget")
            .route(&index(2), Ok("links:http://site.test/i/1,http://site.test/gone".into()))
            .route(
                "http://site.test/gone",
                Err(AppError::HttpError("HTTP 404 for http://site.test/gone".into())),
            );
        let sink = MemorySink::new();

        let outcome = pipeline(fetcher, sink.clone())
            .process_page(2, 10)
            .await
            .unwrap();

        assert!(matches!(outcome, PageOutcome::Done(r) if r.upserted == 1 && r.skipped == 1));
        assert_eq!(sink.done_pages(), vec![2]);
    }

    #[tokio::test]
    async fn test_exhausted_detail_leaves_page_pending() {
        let fetcher = MockFetcher::new("fields:name=Widget")
            .route(&index(3), Ok("links:http://site.test/slow,http://site.test/i/1".into()))
            .route("http://site.test/slow", Err(AppError::Timeout(7)));
        let sink = MemorySink::new();

        let outcome = pipeline(fetcher, sink.clone())
            .process_page(3, 10)
            .await
            .unwrap();

        match outcome {
            PageOutcome::Incomplete { reason, report } => {
                assert!(reason.contains("Retry budget exhausted"));
                assert_eq!(report.upserted, 1);
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
        assert!(sink.done_pages().is_empty());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_challenge_on_detail_rotates() {
        let fetcher = MockFetcher::new("fields:name=Widget")
            .route(&index(5), Ok("links:http://site.test/i/9".into()))
            .script("http://site.test/i/9", vec![Ok("<form>CHALLENGE</form>".into())]);
        let sink = MemorySink::new();

        let outcome = pipeline(fetcher.clone(), sink.clone())
            .process_page(5, 10)
            .await
            .unwrap();

        assert!(matches!(outcome, PageOutcome::Done(r) if r.upserted == 1));
        assert_eq!(fetcher.calls_to("http://site.test/i/9"), 2);
    }

    #[tokio::test]
    async fn test_empty_index_page_is_done() {
        let fetcher = MockFetcher::new("fields:name=Widget").route(&index(8), Ok("links:".into()));
        let sink = MemorySink::new();

        let outcome = pipeline(fetcher, sink.clone())
            .process_page(8, 10)
            .await
            .unwrap();

        assert_eq!(outcome, PageOutcome::Done(PageReport::default()));
        assert_eq!(sink.done_pages(), vec![8]);
    }

    #[tokio::test]
    async fn test_broken_index_page_is_an_error() {
        let fetcher = MockFetcher::new("fields:name=Widget")
            .route(&index(6), Ok("<html>maintenance</html>".into()));
        let sink = MemorySink::new();

        let err = pipeline(fetcher, sink.clone())
            .process_page(6, 10)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::FatalExtraction(_)));
        assert!(sink.done_pages().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_remaining_links() {
        let links: Vec<String> = (0..20).map(|i| format!("http://site.test/i/{i}")).collect();
        let fetcher = MockFetcher::new("fields:name=Widget")
            .with_delay(Duration::from_millis(20))
            .route(&index(9), Ok(format!("links:{}", links.join(","))));
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        let pipeline = cancellable_pipeline(fetcher.clone(), sink.clone(), cancel.clone());

        let (result, ()) = tokio::join!(pipeline.process_page(9, 10), async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(fetcher.calls().len() < 10, "{} calls", fetcher.calls().len());
        assert!(sink.records().len() < 10);
        assert!(sink.done_pages().is_empty());
    }
}
