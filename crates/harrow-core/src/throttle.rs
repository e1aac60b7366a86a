//! Per-lane request pacing.
//!
//! A lane is one `(route, host)` pair, where the route is either a proxy
//! endpoint or the direct connection. Hitting the target too quickly through
//! the same exit address is the fastest way to earn a challenge page, so
//! [`ThrottledFetcher`] spaces requests on each lane by a minimum delay plus
//! random jitter. Different lanes never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use url::Url;

use crate::error::AppError;
use crate::models::Proxy;
use crate::traits::PageFetcher;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum gap between consecutive requests on one lane.
    pub delay: Duration,

    /// Upper bound of uniform random jitter added to `delay`.
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let max_us = u64::try_from(self.jitter.as_micros()).unwrap_or(u64::MAX);
        let jitter_us = rand::thread_rng().gen_range(0..=max_us);
        self.delay + Duration::from_micros(jitter_us)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

/// A [`PageFetcher`] wrapper that paces requests per lane.
#[derive(Clone)]
pub struct ThrottledFetcher<F> {
    inner: F,
    config: ThrottleConfig,
    last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<F: PageFetcher> ThrottledFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            last_request: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lane_key(url: &str, proxy: Option<&Proxy>) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let host = url.host_str()?;
        let route = proxy.map(|p| p.endpoint.as_str()).unwrap_or("direct");
        Some(format!("{route}|{host}"))
    }

    /// Reserve the next slot on `lane` and sleep until it arrives.
    async fn wait_for_lane(&self, lane: &str) {
        let wait = {
            let mut map = self.last_request.lock().await;
            let now = Instant::now();
            let slot = match map.get(lane) {
                Some(&last) => std::cmp::max(now, last + self.config.effective_delay()),
                None => now,
            };
            map.insert(lane.to_string(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tracing::debug!(%lane, sleep_ms = %wait.as_millis(), "Throttling request");
            tokio::time::sleep(wait).await;
        }
    }
}

impl<F: PageFetcher> PageFetcher for ThrottledFetcher<F> {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> Result<String, AppError> {
        if let Some(lane) = Self::lane_key(url, proxy) {
            self.wait_for_lane(&lane).await;
        }
        self.inner.fetch(url, proxy, timeout).await
    }
}
