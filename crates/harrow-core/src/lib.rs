pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fetch;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod session;
pub mod throttle;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{CrawlConfig, RetryPolicy, WorkerConfig};
pub use error::AppError;
pub use fetch::{Fetched, RotatingFetcher};
pub use memory::{MemoryProxyStore, MemorySink};
pub use models::{
    ExtractedRecord, Extraction, FieldRule, FieldRules, NewProxy, Proxy, ProxyKey, ProxyScheme,
    ProxyStats, SelectionPolicy, UpsertOutcome, WorkUnit, compute_hash,
};
pub use orchestrator::{Orchestrator, OrchestratorState, PassSummary};
pub use partition::partition;
pub use pipeline::{PageOutcome, PagePipeline, PageReport, TargetSite};
pub use queue::{Dequeued, TaskQueue};
pub use registry::{ProbeTarget, ProxyRegistry, Verification, VerifySummary};
pub use session::SessionGuard;
pub use throttle::{ThrottleConfig, ThrottledFetcher};
pub use traits::{Extractor, NoSession, PageFetcher, ProxySource, ProxyStore, SessionProvider, Sink};
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerReporter, WorkerService, WorkerSummary};
