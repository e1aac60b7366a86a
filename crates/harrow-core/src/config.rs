use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::SelectionPolicy;

/// Bounds on the rotate-and-retry loop, with exponential backoff between
/// attempts.
///
/// Delay schedule with the defaults: 500ms, 1s, 2s, 4s, ... capped at 30s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wall-clock ceiling for one URL, including backoff sleeps.
    pub max_elapsed: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_elapsed: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.backoff_max)
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_max_elapsed(mut self, max: Duration) -> Self {
        self.max_elapsed = max;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }
}

/// Configuration for a single worker task.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How long an empty queue is tolerated before the worker exits.
    pub worker_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            worker_timeout: Duration::from_secs(20),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }
}

/// Everything a crawl needs. The orchestrator reads the pass settings;
/// `request_timeout`, `selection`, `retry` and `allow_direct` configure the
/// fetcher through [`RotatingFetcher::from_config`].
///
/// [`RotatingFetcher::from_config`]: crate::fetch::RotatingFetcher::from_config
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub worker_timeout: Duration,
    pub request_timeout: Duration,
    pub poll_delay: Duration,
    /// Size of the page index `[0, total_pages)`.
    pub total_pages: u64,
    pub page_size: u32,
    pub selection: SelectionPolicy,
    pub retry: RetryPolicy,
    /// Go out without a proxy when none is eligible.
    pub allow_direct: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 80,
            worker_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(7),
            poll_delay: Duration::from_secs(5),
            total_pages: 0,
            page_size: 100,
            selection: SelectionPolicy::Lru,
            retry: RetryPolicy::default(),
            allow_direct: false,
        }
    }
}

impl CrawlConfig {
    pub fn new(total_pages: u64) -> Self {
        Self {
            total_pages,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_selection(mut self, policy: SelectionPolicy) -> Self {
        self.selection = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_direct_fallback(mut self, allow: bool) -> Self {
        self.allow_direct = allow;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker_count == 0 {
            return Err(AppError::ConfigError("worker_count must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::ConfigError("queue_capacity must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(AppError::ConfigError("page_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.worker_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "worker_timeout and request_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
