//! Rotate-and-retry fetching.
//!
//! [`RotatingFetcher`] is the only place a URL is retried. Each attempt takes
//! a proxy from the registry; a transient failure freezes that proxy, backs
//! off and tries again with a fresh one. Attempts and wall-clock time are
//! both bounded by [`RetryPolicy`], and running out of either yields
//! [`AppError::RetryBudgetExhausted`].

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::{CrawlConfig, RetryPolicy};
use crate::error::AppError;
use crate::models::{Proxy, ProxyKey, SelectionPolicy};
use crate::registry::ProxyRegistry;
use crate::traits::{PageFetcher, ProxyStore};

/// A successfully classified document.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    /// Proxy that carried the successful attempt; `None` for direct.
    pub proxy: Option<ProxyKey>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RotatingFetcher<F: PageFetcher, S: ProxyStore> {
    fetcher: F,
    registry: ProxyRegistry<S>,
    policy: RetryPolicy,
    selection: SelectionPolicy,
    request_timeout: Duration,
    /// Present when direct attempts are allowed.
    direct: Option<CircuitBreaker>,
    cancel: CancellationToken,
}

impl<F, S> RotatingFetcher<F, S>
where
    F: PageFetcher,
    S: ProxyStore + 'static,
{
    pub fn new(fetcher: F, registry: ProxyRegistry<S>, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            registry,
            policy,
            selection: SelectionPolicy::default(),
            request_timeout: Duration::from_secs(7),
            direct: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Retry policy, selection, request timeout and direct lane taken from
    /// `config`. The direct lane gets a default breaker.
    pub fn from_config(fetcher: F, registry: ProxyRegistry<S>, config: &CrawlConfig) -> Self {
        let rotating = Self::new(fetcher, registry, config.retry.clone())
            .with_selection(config.selection)
            .with_request_timeout(config.request_timeout);
        if config.allow_direct {
            rotating.with_direct_fallback(CircuitBreaker::new(
                "direct",
                CircuitBreakerConfig::default(),
            ))
        } else {
            rotating
        }
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allow proxy-less attempts when no proxy is eligible, guarded by
    /// `breaker`.
    pub fn with_direct_fallback(mut self, breaker: CircuitBreaker) -> Self {
        self.direct = Some(breaker);
        self
    }

    /// Once `cancel` fires, no new attempt starts and the attempt or backoff
    /// in progress ends with [`AppError::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &ProxyRegistry<S> {
        &self.registry
    }

    /// Fetch `url` and hand the body to `classify`, retrying through fresh
    /// proxies while either step fails transiently.
    ///
    /// `classify` turns a body into a value or an error; returning
    /// [`AppError::ChallengeDetected`] from it rotates the proxy just like a
    /// transport failure.
    pub async fn fetch_with<T, C>(&self, url: &str, classify: C) -> Result<Fetched<T>, AppError>
    where
        C: Fn(&str) -> Result<T, AppError>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut last_error: Option<AppError> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            attempt += 1;

            let proxy = match self.pick_proxy().await {
                Ok(proxy) => proxy,
                // Earlier attempts froze the rest of the pool.
                Err(AppError::NoProxyAvailable) if last_error.is_some() => {
                    let attempts = attempt - 1;
                    let error = last_error.map(|e| e.to_string()).unwrap_or_default();
                    tracing::warn!(%url, attempts, %error, "Retry budget exhausted, pool is empty");
                    return Err(AppError::RetryBudgetExhausted {
                        attempts,
                        last_error: error,
                    });
                }
                Err(e) => return Err(e),
            };

            let outcome = tokio::select! {
                outcome = async {
                    match &proxy {
                        Some(p) => self.attempt_via(url, p, &classify).await,
                        None => self.attempt_direct(url, &classify).await,
                    }
                } => outcome,
                () = self.cancel.cancelled() => return Err(AppError::Cancelled),
            };

            let error = match outcome {
                Ok(value) => {
                    return Ok(Fetched {
                        value,
                        proxy: proxy.map(|p| p.key()),
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            let route = proxy
                .as_ref()
                .map(|p| p.endpoint.as_str())
                .unwrap_or("direct");
            tracing::debug!(%url, proxy = route, attempt, %error, "Transient fetch failure");

            if let Some(p) = &proxy
                && error.should_freeze_proxy()
                && let Err(e) = self.registry.freeze(&p.key()).await
            {
                tracing::warn!(proxy = %p.endpoint, error = %e, "Failed to freeze proxy");
            }

            let delay = self.policy.delay_for_attempt(attempt);
            if attempt >= self.policy.max_attempts
                || started.elapsed() + delay >= self.policy.max_elapsed
            {
                tracing::warn!(%url, attempts = attempt, %error, "Retry budget exhausted");
                return Err(AppError::RetryBudgetExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            last_error = Some(error);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
    }

    /// Plain fetch with retry; the body is returned as-is.
    pub async fn fetch(&self, url: &str) -> Result<Fetched<String>, AppError> {
        self.fetch_with(url, |body| Ok(body.to_string())).await
    }

    /// `Some(proxy)`, or `None` to go direct. Without a direct lane an empty
    /// registry is an error: the caller's page stalls until a later pass.
    async fn pick_proxy(&self) -> Result<Option<Proxy>, AppError> {
        match self.registry.select(self.selection).await {
            Ok(proxy) => Ok(Some(proxy)),
            Err(AppError::NoProxyAvailable) if self.direct.is_some() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn attempt_via<T, C>(&self, url: &str, proxy: &Proxy, classify: &C) -> Result<T, AppError>
    where
        C: Fn(&str) -> Result<T, AppError>,
    {
        let body = self
            .fetcher
            .fetch(url, Some(proxy), self.request_timeout)
            .await?;
        classify(&body)
    }

    async fn attempt_direct<T, C>(&self, url: &str, classify: &C) -> Result<T, AppError>
    where
        C: Fn(&str) -> Result<T, AppError>,
    {
        let Some(breaker) = &self.direct else {
            return Err(AppError::NoProxyAvailable);
        };
        breaker
            .call(|| async {
                let body = self.fetcher.fetch(url, None, self.request_timeout).await?;
                classify(&body)
            })
            .await
            .map_err(AppError::from)
    }
}
