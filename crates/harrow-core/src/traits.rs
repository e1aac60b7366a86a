use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{
    ExtractedRecord, Extraction, FieldRules, NewProxy, Proxy, ProxyKey, ProxyStats,
    SelectionPolicy, UpsertOutcome, WorkUnit,
};

/// Performs one outbound GET, optionally routed through a proxy.
///
/// Implementations classify failures: connect/reset/timeout/tunnel errors as
/// transient ([`AppError::is_transient`]), any non-2xx as
/// [`AppError::HttpError`].
pub trait PageFetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Parses fetched documents with site-specific selector rules. Never does I/O.
pub trait Extractor: Send + Sync + Clone {
    /// Pull the configured fields out of a detail page.
    fn extract(
        &self,
        html: &str,
        rules: &FieldRules,
    ) -> Result<Extraction<BTreeMap<String, String>>, AppError>;

    /// Collect detail links from an index page, resolved against `base_url`.
    fn links(
        &self,
        html: &str,
        base_url: &str,
        rules: &FieldRules,
    ) -> Result<Extraction<Vec<String>>, AppError>;
}

/// Persistence collaborator for extracted records and page completion.
///
/// Every method must be idempotent; concurrent upserts on the same key must
/// serialize safely.
pub trait Sink: Send + Sync + Clone {
    fn upsert(
        &self,
        record: &ExtractedRecord,
    ) -> impl Future<Output = Result<UpsertOutcome, AppError>> + Send;

    fn is_page_done(&self, page_ref: u64) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn mark_page_done(
        &self,
        page_ref: u64,
        page_size: u32,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Pages in `unit` that are not marked done, ascending.
    fn list_pending(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<Vec<u64>, AppError>> + Send;
}

/// Storage behind the proxy registry.
///
/// Each mutation must be a single atomic update; last write wins.
pub trait ProxyStore: Send + Sync + Clone {
    /// Insert candidates, ignoring keys that already exist. Returns the
    /// number of new rows.
    fn insert_many(
        &self,
        candidates: &[NewProxy],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Pick one eligible proxy. Under [`SelectionPolicy::Lru`] the pick's
    /// `updated_at` is bumped in the same step so concurrent callers rotate.
    fn select(
        &self,
        policy: SelectionPolicy,
    ) -> impl Future<Output = Result<Option<Proxy>, AppError>> + Send;

    fn get(&self, key: &ProxyKey) -> impl Future<Output = Result<Option<Proxy>, AppError>> + Send;

    fn freeze(&self, key: &ProxyKey) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a successful verification. Sets `ping_ms`; a deleted proxy is
    /// left untouched.
    fn record_verified(
        &self,
        key: &ProxyKey,
        ping_ms: u32,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn mark_deleted(&self, key: &ProxyKey) -> impl Future<Output = Result<(), AppError>> + Send;

    fn unfreeze_all(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Every proxy that has not been deleted, oldest first.
    fn list_verifiable(&self) -> impl Future<Output = Result<Vec<Proxy>, AppError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<ProxyStats, AppError>> + Send;
}

/// Discovers proxy candidates from some public listing.
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;

    fn discover(&self) -> impl Future<Output = Result<Vec<NewProxy>, AppError>> + Send;
}

/// Opens and releases the external session a worker holds for its lifetime
/// (e.g. a remote browser handle).
pub trait SessionProvider: Send + Sync + Clone + 'static {
    type Session: Send + 'static;

    fn open(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    /// Must not block; called from `Drop`.
    fn release(&self, session: Self::Session);
}

/// Session provider for plain HTTP crawling, where workers hold nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl SessionProvider for NoSession {
    type Session = ();

    async fn open(&self, _worker_id: &str) -> Result<(), AppError> {
        Ok(())
    }

    fn release(&self, _session: ()) {}
}
