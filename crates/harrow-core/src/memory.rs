//! In-process implementations of [`ProxyStore`] and [`Sink`].
//!
//! Useful for dry runs and as the reference behaviour the database-backed
//! stores are tested against. All state lives behind a `std::sync::Mutex`;
//! every operation is one critical section, so mutations are atomic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::error::AppError;
use crate::models::{
    ExtractedRecord, NewProxy, Proxy, ProxyKey, ProxyStats, SelectionPolicy, UpsertOutcome,
    WorkUnit,
};
use crate::traits::{ProxyStore, Sink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// MemoryProxyStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryProxyStore {
    proxies: Arc<Mutex<BTreeMap<ProxyKey, Proxy>>>,
}

impl MemoryProxyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `http` proxies at the given endpoints.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut proxies = lock(&store.proxies);
            let now = Utc::now();
            for endpoint in endpoints {
                let proxy = NewProxy::new(endpoint, crate::models::ProxyScheme::Http, "seed")
                    .into_proxy(now);
                proxies.insert(proxy.key(), proxy);
            }
        }
        store
    }

    pub fn snapshot(&self) -> Vec<Proxy> {
        lock(&self.proxies).values().cloned().collect()
    }

    fn update<F>(&self, key: &ProxyKey, apply: F)
    where
        F: FnOnce(&mut Proxy),
    {
        if let Some(proxy) = lock(&self.proxies).get_mut(key) {
            apply(proxy);
            proxy.updated_at = Utc::now();
        }
    }
}

impl ProxyStore for MemoryProxyStore {
    async fn insert_many(&self, candidates: &[NewProxy]) -> Result<u64, AppError> {
        let mut proxies = lock(&self.proxies);
        let now = Utc::now();
        let mut inserted = 0;
        for candidate in candidates {
            let key = ProxyKey::new(candidate.endpoint.clone(), candidate.scheme);
            if !proxies.contains_key(&key) {
                proxies.insert(key, candidate.clone().into_proxy(now));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn select(&self, policy: SelectionPolicy) -> Result<Option<Proxy>, AppError> {
        let mut proxies = lock(&self.proxies);
        let picked = match policy {
            SelectionPolicy::Random => {
                let eligible: Vec<&Proxy> = proxies.values().filter(|p| p.is_eligible()).collect();
                eligible.choose(&mut rand::thread_rng()).map(|p| p.key())
            }
            SelectionPolicy::Lru => proxies
                .values()
                .filter(|p| p.is_eligible())
                .min_by_key(|p| (p.updated_at, p.ping_ms.unwrap_or(u32::MAX)))
                .map(|p| p.key()),
        };

        let Some(key) = picked else {
            return Ok(None);
        };
        let proxy = proxies.get_mut(&key).map(|p| {
            if policy == SelectionPolicy::Lru {
                p.updated_at = Utc::now();
            }
            p.clone()
        });
        Ok(proxy)
    }

    async fn get(&self, key: &ProxyKey) -> Result<Option<Proxy>, AppError> {
        Ok(lock(&self.proxies).get(key).cloned())
    }

    async fn freeze(&self, key: &ProxyKey) -> Result<(), AppError> {
        self.update(key, |p| p.is_frozen = true);
        Ok(())
    }

    async fn record_verified(&self, key: &ProxyKey, ping_ms: u32) -> Result<(), AppError> {
        self.update(key, |p| {
            if !p.is_deleted {
                p.ping_ms = Some(ping_ms);
            }
        });
        Ok(())
    }

    async fn mark_deleted(&self, key: &ProxyKey) -> Result<(), AppError> {
        self.update(key, |p| p.is_deleted = true);
        Ok(())
    }

    async fn unfreeze_all(&self) -> Result<u64, AppError> {
        let mut proxies = lock(&self.proxies);
        let now = Utc::now();
        let mut count = 0;
        for proxy in proxies.values_mut().filter(|p| p.is_frozen) {
            proxy.is_frozen = false;
            proxy.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn list_verifiable(&self) -> Result<Vec<Proxy>, AppError> {
        let mut proxies: Vec<Proxy> = lock(&self.proxies)
            .values()
            .filter(|p| !p.is_deleted)
            .cloned()
            .collect();
        proxies.sort_by_key(|p| (p.created_at, p.updated_at));
        Ok(proxies)
    }

    async fn stats(&self) -> Result<ProxyStats, AppError> {
        let proxies = lock(&self.proxies);
        let mut stats = ProxyStats::default();
        for proxy in proxies.values() {
            stats.total += 1;
            if proxy.is_deleted {
                stats.deleted += 1;
            } else if proxy.is_frozen {
                stats.frozen += 1;
            } else {
                stats.eligible += 1;
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    /// natural_key -> (record, fields hash)
    records: BTreeMap<String, (ExtractedRecord, String)>,
    done_pages: BTreeSet<u64>,
}

#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored records ordered by natural key.
    pub fn records(&self) -> Vec<ExtractedRecord> {
        lock(&self.state)
            .records
            .values()
            .map(|(record, _)| record.clone())
            .collect()
    }

    pub fn done_pages(&self) -> Vec<u64> {
        lock(&self.state).done_pages.iter().copied().collect()
    }
}

impl Sink for MemorySink {
    async fn upsert(&self, record: &ExtractedRecord) -> Result<UpsertOutcome, AppError> {
        let hash = record.fields_hash();
        let mut state = lock(&self.state);
        let outcome = match state.records.get(&record.natural_key) {
            None => UpsertOutcome::Inserted,
            Some((existing, existing_hash))
                if *existing_hash == hash && existing.page_ref == record.page_ref =>
            {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Updated,
        };
        let mut stored = record.clone();
        stored.completed = true;
        state
            .records
            .insert(record.natural_key.clone(), (stored, hash));
        Ok(outcome)
    }

    async fn is_page_done(&self, page_ref: u64) -> Result<bool, AppError> {
        Ok(lock(&self.state).done_pages.contains(&page_ref))
    }

    async fn mark_page_done(&self, page_ref: u64, _page_size: u32) -> Result<(), AppError> {
        lock(&self.state).done_pages.insert(page_ref);
        Ok(())
    }

    async fn list_pending(&self, unit: &WorkUnit) -> Result<Vec<u64>, AppError> {
        let state = lock(&self.state);
        Ok(unit
            .pages()
            .filter(|page| !state.done_pages.contains(page))
            .collect())
    }
}
