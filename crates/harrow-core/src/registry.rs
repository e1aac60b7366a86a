//! Proxy registry: selection, freezing and verification on top of a
//! [`ProxyStore`].
//!
//! The store owns the health fields; the registry adds the policy around
//! them. Verification is coalesced per proxy key so two callers asking for
//! the same proxy at the same time share one probe request.

use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use moka::future::Cache;
use serde::Serialize;

use crate::error::AppError;
use crate::models::{NewProxy, Proxy, ProxyKey, ProxyStats, SelectionPolicy};
use crate::traits::{PageFetcher, ProxySource, ProxyStore};

/// Upper bound on distinct proxies with a verification in flight.
const MAX_IN_FLIGHT: u64 = 10_000;

/// Stable third-party page used only to check that a proxy forwards traffic
/// faithfully.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub url: String,
    /// Text that must appear in the body; rewriting proxies lose it.
    pub marker: String,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn new(url: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            marker: marker.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self::new("https://ya.ru/", "Яндекс")
    }
}

/// Outcome of probing one proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { ping_ms: u32 },
    Failed { reason: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifySummary {
    pub verified: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct ProxyRegistry<S: ProxyStore> {
    store: S,
    in_flight: Cache<ProxyKey, Result<Verification, AppError>>,
}

impl<S: ProxyStore + 'static> ProxyRegistry<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            in_flight: Cache::builder().max_capacity(MAX_IN_FLIGHT).build(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One eligible proxy, or [`AppError::NoProxyAvailable`].
    pub async fn select(&self, policy: SelectionPolicy) -> Result<Proxy, AppError> {
        self.store
            .select(policy)
            .await?
            .ok_or(AppError::NoProxyAvailable)
    }

    pub async fn freeze(&self, key: &ProxyKey) -> Result<(), AppError> {
        tracing::debug!(proxy = %key, "Freezing proxy");
        self.store.freeze(key).await
    }

    pub async fn unfreeze_all(&self) -> Result<u64, AppError> {
        let count = self.store.unfreeze_all().await?;
        tracing::info!(count, "Unfroze proxies");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<ProxyStats, AppError> {
        self.store.stats().await
    }

    /// Insert candidates, ignoring ones already known.
    pub async fn ingest(&self, candidates: &[NewProxy]) -> Result<u64, AppError> {
        if candidates.is_empty() {
            return Ok(0);
        }
        self.store.insert_many(candidates).await
    }

    /// Pull candidates from `source` and ingest them.
    pub async fn discover<P: ProxySource>(&self, source: &P) -> Result<u64, AppError> {
        let candidates = source.discover().await?;
        let found = candidates.len();
        let inserted = self.ingest(&candidates).await?;
        tracing::info!(source = source.name(), found, inserted, "Proxy discovery finished");
        Ok(inserted)
    }

    /// Probe `proxy` against `probe` and record the outcome.
    ///
    /// Concurrent calls for the same key wait for the probe already in
    /// flight and receive its result instead of sending another request.
    /// Store failures are returned as errors; probe failures are a
    /// [`Verification::Failed`] and flag the proxy deleted. Deleted proxies
    /// are never probed again.
    pub async fn verify<F: PageFetcher>(
        &self,
        fetcher: &F,
        proxy: &Proxy,
        probe: &ProbeTarget,
    ) -> Result<Verification, AppError> {
        let key = proxy.key();
        let outcome = self
            .in_flight
            .get_with(key.clone(), self.probe(fetcher, proxy, probe))
            .await;
        self.in_flight.invalidate(&key).await;
        outcome
    }

    async fn probe<F: PageFetcher>(
        &self,
        fetcher: &F,
        proxy: &Proxy,
        probe: &ProbeTarget,
    ) -> Result<Verification, AppError> {
        let key = proxy.key();
        if let Some(stored) = self.store.get(&key).await?
            && stored.is_deleted
        {
            return Ok(Verification::Failed {
                reason: "proxy is deleted".into(),
            });
        }

        let started = Instant::now();
        let result = fetcher.fetch(&probe.url, Some(proxy), probe.timeout).await;

        let failure = match result {
            Ok(body) if body.contains(&probe.marker) => None,
            Ok(_) => Some(AppError::ProxyVerificationFailed(
                "probe marker missing from response".into(),
            )),
            Err(e) => Some(AppError::ProxyVerificationFailed(e.to_string())),
        };

        match failure {
            None => {
                let ping_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);
                self.store.record_verified(&key, ping_ms).await?;
                tracing::debug!(proxy = %key, ping_ms, "Proxy verified");
                Ok(Verification::Verified { ping_ms })
            }
            Some(error) => {
                self.store.mark_deleted(&key).await?;
                tracing::debug!(proxy = %key, %error, "Proxy failed verification");
                Ok(Verification::Failed {
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Verify every proxy that has not been deleted, `concurrency` at a time.
    pub async fn verify_all<F: PageFetcher>(
        &self,
        fetcher: &F,
        probe: &ProbeTarget,
        concurrency: usize,
    ) -> Result<VerifySummary, AppError> {
        let proxies = self.store.list_verifiable().await?;
        tracing::info!(count = proxies.len(), concurrency, "Verifying proxies");

        let outcomes: Vec<Result<Verification, AppError>> = stream::iter(proxies)
            .map(|proxy| async move { self.verify(fetcher, &proxy, probe).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut summary = VerifySummary::default();
        for outcome in outcomes {
            match outcome? {
                Verification::Verified { .. } => summary.verified += 1,
                Verification::Failed { .. } => summary.failed += 1,
            }
        }
        tracing::info!(verified = summary.verified, failed = summary.failed, "Verification pass finished");
        Ok(summary)
    }
}
