use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which traffic a proxy is able to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProxyScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            _ => Err(format!("Unknown proxy scheme: {}", s)),
        }
    }
}

/// Unique identity of a proxy: `(endpoint, scheme)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyKey {
    pub endpoint: String,
    pub scheme: ProxyScheme,
}

impl ProxyKey {
    pub fn new(endpoint: impl Into<String>, scheme: ProxyScheme) -> Self {
        Self {
            endpoint: endpoint.into(),
            scheme,
        }
    }
}

impl fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.scheme)
    }
}

/// A proxy candidate and its health state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// Full proxy URI, e.g. `http://203.0.113.7:8080`.
    pub endpoint: String,
    pub scheme: ProxyScheme,
    /// Round-trip of the last successful verification.
    pub ping_ms: Option<u32>,
    /// Suspected bad for the current target; excluded until unfrozen.
    pub is_frozen: bool,
    /// Failed verification; never selected again.
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Where the candidate was discovered.
    pub source: String,
}

impl Proxy {
    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(self.endpoint.clone(), self.scheme)
    }

    pub fn is_eligible(&self) -> bool {
        !self.is_frozen && !self.is_deleted
    }
}

/// A freshly discovered proxy, before it has any health state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxy {
    pub endpoint: String,
    pub scheme: ProxyScheme,
    pub source: String,
}

impl NewProxy {
    pub fn new(endpoint: impl Into<String>, scheme: ProxyScheme, source: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            scheme,
            source: source.into(),
        }
    }

    pub fn into_proxy(self, now: DateTime<Utc>) -> Proxy {
        Proxy {
            endpoint: self.endpoint,
            scheme: self.scheme,
            ping_ms: None,
            is_frozen: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            source: self.source,
        }
    }
}

/// Counts of proxies per health state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    pub total: u64,
    pub eligible: u64,
    pub frozen: u64,
    pub deleted: u64,
}

/// A disjoint, half-open slice `[range_start, range_end)` of the page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub range_start: u64,
    pub range_end: u64,
    pub page_size: u32,
}

impl WorkUnit {
    pub fn len(&self) -> u64 {
        self.range_end.saturating_sub(self.range_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pages(&self) -> std::ops::Range<u64> {
        self.range_start..self.range_end
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.range_start, self.range_end)
    }
}

/// One record extracted from a detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// Globally unique key, typically the detail page URL.
    pub natural_key: String,
    /// Index page the record was discovered on.
    pub page_ref: u64,
    pub fields: BTreeMap<String, String>,
    pub completed: bool,
}

impl ExtractedRecord {
    pub fn new(natural_key: impl Into<String>, page_ref: u64, fields: BTreeMap<String, String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            page_ref,
            fields,
            completed: true,
        }
    }

    /// Stable hash of the field map, used to detect no-op upserts.
    pub fn fields_hash(&self) -> String {
        let canonical = serde_json::to_string(&self.fields).unwrap_or_default();
        compute_hash(&canonical)
    }
}

/// How the registry picks among eligible proxies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Uniformly random among eligible proxies.
    Random,
    /// Least recently used first, fastest ping breaking ties.
    #[default]
    Lru,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Random => "random",
            SelectionPolicy::Lru => "lru",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(SelectionPolicy::Random),
            "lru" => Ok(SelectionPolicy::Lru),
            _ => Err(format!("Unknown selection policy: {}", s)),
        }
    }
}

/// What an upsert did to the stored record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same key and identical fields: nothing observable changed.
    Unchanged,
}

/// One named field pulled out of a detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    /// CSS selector; the first match wins.
    pub selector: String,
    /// Read this attribute instead of the element text.
    #[serde(default)]
    pub attribute: Option<String>,
}

/// Selectors supplied by the target-site collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRules {
    /// Matches only on anti-bot interstitials.
    pub challenge_selector: String,
    /// Detail links on an index page (`href` is read).
    pub link_selector: String,
    pub fields: Vec<FieldRule>,
}

/// Result of running the extractor over one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction<T> {
    Found(T),
    ChallengeDetected,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
