//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability so tests can assert on recorded
//! calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{Extraction, FieldRule, FieldRules, Proxy};
use crate::traits::{Extractor, PageFetcher, SessionProvider};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

type Response = Result<String, AppError>;

/// Mock fetcher with layered, per-URL and per-proxy responses.
///
/// Resolution order for each call: scripted queue for the URL, failure
/// registered for the proxy, fixed route for the URL, default response.
#[derive(Clone)]
pub struct MockFetcher {
    default: Arc<Mutex<Response>>,
    routes: Arc<Mutex<HashMap<String, Response>>>,
    scripted: Arc<Mutex<HashMap<String, VecDeque<Response>>>>,
    proxy_failures: Arc<Mutex<HashMap<String, AppError>>>,
    calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
    delay: Duration,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_default(Ok(html.to_string()))
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_default(Err(error))
    }

    fn with_default(default: Response) -> Self {
        Self {
            default: Arc::new(Mutex::new(default)),
            routes: Arc::new(Mutex::new(HashMap::new())),
            scripted: Arc::new(Mutex::new(HashMap::new())),
            proxy_failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Always answer `url` with `response`.
    pub fn route(self, url: &str, response: Response) -> Self {
        self.routes.lock().unwrap().insert(url.to_string(), response);
        self
    }

    /// Answer the next calls to `url` with `responses`, in order.
    pub fn script(self, url: &str, responses: Vec<Response>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
        self
    }

    /// Every request routed through `endpoint` fails with `error`.
    pub fn fail_through(self, endpoint: &str, error: AppError) -> Self {
        self.proxy_failures
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), error);
        self
    }

    /// Recorded `(url, proxy endpoint)` pairs.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    fn resolve(&self, url: &str, proxy: Option<&Proxy>) -> Response {
        if let Some(queue) = self.scripted.lock().unwrap().get_mut(url)
            && let Some(response) = queue.pop_front()
        {
            return response;
        }
        if let Some(p) = proxy
            && let Some(err) = self.proxy_failures.lock().unwrap().get(&p.endpoint)
        {
            return Err(err.clone());
        }
        if let Some(response) = self.routes.lock().unwrap().get(url) {
            return response.clone();
        }
        self.default.lock().unwrap().clone()
    }
}

impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str, proxy: Option<&Proxy>, _timeout: Duration) -> Response {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), proxy.map(|p| p.endpoint.clone())));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.resolve(url, proxy)
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Extractor over a tiny text format instead of HTML:
///
/// - any body containing `CHALLENGE` is a challenge page;
/// - `links:a,b,c` is an index page with detail links `a`, `b`, `c`;
/// - `fields:name=Widget;price=10` is a detail page;
/// - anything else is a fatal extraction error.
#[derive(Clone, Default)]
pub struct MockExtractor;

impl Extractor for MockExtractor {
    fn extract(
        &self,
        html: &str,
        _rules: &FieldRules,
    ) -> Result<Extraction<BTreeMap<String, String>>, AppError> {
        if html.contains("CHALLENGE") {
            return Ok(Extraction::ChallengeDetected);
        }
        let body = html
            .strip_prefix("fields:")
            .ok_or_else(|| AppError::FatalExtraction(format!("not a detail page: {html}")))?;
        let fields = body
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(Extraction::Found(fields))
    }

    fn links(
        &self,
        html: &str,
        _base_url: &str,
        _rules: &FieldRules,
    ) -> Result<Extraction<Vec<String>>, AppError> {
        if html.contains("CHALLENGE") {
            return Ok(Extraction::ChallengeDetected);
        }
        let body = html
            .strip_prefix("links:")
            .ok_or_else(|| AppError::FatalExtraction(format!("not an index page: {html}")))?;
        Ok(Extraction::Found(
            body.split(',')
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

pub fn test_rules() -> FieldRules {
    FieldRules {
        challenge_selector: "body > form".into(),
        link_selector: "a.detail".into(),
        fields: vec![FieldRule {
            name: "name".into(),
            selector: "h1".into(),
            attribute: None,
        }],
    }
}

// ---------------------------------------------------------------------------
// MockSessions
// ---------------------------------------------------------------------------

/// Session provider that counts opens and releases.
#[derive(Clone, Default)]
pub struct MockSessions {
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
    fail_open: bool,
}

impl MockSessions {
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl SessionProvider for MockSessions {
    type Session = String;

    async fn open(&self, worker_id: &str) -> Result<String, AppError> {
        if self.fail_open {
            return Err(AppError::Generic("session hub unavailable".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(format!("session-{worker_id}"))
    }

    fn release(&self, _session: String) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps a debug rendering of every event.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for RecordingReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}
