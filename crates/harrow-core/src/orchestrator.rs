//! Pass scheduling.
//!
//! One pass partitions the page index, runs a producer that enqueues every
//! unit with pending pages, and lets N workers drain the queue. [`Orchestrator::run`]
//! repeats passes with a fixed sleep in between until the shutdown token
//! fires:
//!
//! ```text
//! IDLE -> RUNNING -> DRAINED -> SLEEPING -> RUNNING -> ...
//!            \__________\___________\______> STOPPED (shutdown only)
//! ```

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{CrawlConfig, WorkerConfig};
use crate::error::AppError;
use crate::models::WorkUnit;
use crate::partition::partition;
use crate::pipeline::PagePipeline;
use crate::queue::TaskQueue;
use crate::traits::{Extractor, PageFetcher, ProxyStore, SessionProvider, Sink};
use crate::worker::{TracingWorkerReporter, WorkerReporter, WorkerService, WorkerSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    Drained,
    Sleeping,
    Stopped,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Running => "running",
            OrchestratorState::Drained => "drained",
            OrchestratorState::Sleeping => "sleeping",
            OrchestratorState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Totals for one pass across all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub units_enqueued: u64,
    pub pages_done: u64,
    pub pages_skipped: u64,
    pub pages_failed: u64,
    pub records_upserted: u64,
}

impl PassSummary {
    fn absorb(&mut self, worker: &WorkerSummary) {
        self.pages_done += worker.pages_done;
        self.pages_skipped += worker.pages_skipped;
        self.pages_failed += worker.pages_failed;
        self.records_upserted += worker.records_upserted;
    }
}

pub struct Orchestrator<F, S, E, K, P>
where
    F: PageFetcher,
    S: ProxyStore,
    E: Extractor,
    K: Sink,
    P: SessionProvider,
{
    pipeline: PagePipeline<F, S, E, K>,
    sessions: P,
    config: CrawlConfig,
    reporter: Arc<dyn WorkerReporter>,
    state: watch::Sender<OrchestratorState>,
}

impl<F, S, E, K, P> Orchestrator<F, S, E, K, P>
where
    F: PageFetcher + 'static,
    S: ProxyStore + 'static,
    E: Extractor + 'static,
    K: Sink + 'static,
    P: SessionProvider,
{
    pub fn new(
        pipeline: PagePipeline<F, S, E, K>,
        sessions: P,
        config: CrawlConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Ok(Self {
            pipeline,
            sessions,
            config,
            reporter: Arc::new(TracingWorkerReporter),
            state,
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn WorkerReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: OrchestratorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Orchestrator state change");
        }
    }

    /// Poll forever: run a pass, sleep `poll_delay`, repeat. Returns once
    /// `cancel` fires, or on a configuration error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AppError> {
        tracing::info!(
            workers = self.config.worker_count,
            total_pages = self.config.total_pages,
            poll_delay_secs = self.config.poll_delay.as_secs(),
            "Orchestrator starting"
        );

        while !cancel.is_cancelled() {
            match self.run_pass(&cancel).await {
                Ok(summary) => log_pass(&summary),
                Err(e @ AppError::ConfigError(_)) => {
                    self.transition(OrchestratorState::Stopped);
                    return Err(e);
                }
                Err(e) => tracing::error!(error = %e, "Pass failed"),
            }

            self.transition(OrchestratorState::Sleeping);
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_delay) => {}
                () = cancel.cancelled() => break,
            }
        }

        self.transition(OrchestratorState::Stopped);
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    /// A single pass, then stop.
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<PassSummary, AppError> {
        let result = self.run_pass(&cancel).await;
        if let Ok(summary) = &result {
            log_pass(summary);
        }
        self.transition(OrchestratorState::Stopped);
        result
    }

    /// Produce and drain one pass.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassSummary, AppError> {
        let units = partition(
            self.config.total_pages,
            self.config.worker_count,
            self.config.page_size,
        )?;
        self.transition(OrchestratorState::Running);

        let queue = TaskQueue::new(self.config.queue_capacity, cancel.clone());
        let producer = tokio::spawn(produce(
            units,
            self.pipeline.sink().clone(),
            queue.clone(),
        ));

        let workers: Vec<_> = (0..self.config.worker_count)
            .map(|i| {
                let worker = WorkerService::new(
                    self.pipeline.clone(),
                    self.sessions.clone(),
                    WorkerConfig::default()
                        .with_worker_id(format!("worker-{i}"))
                        .with_worker_timeout(self.config.worker_timeout),
                );
                let queue = queue.clone();
                let cancel = cancel.clone();
                let reporter = Arc::clone(&self.reporter);
                tokio::spawn(async move { worker.run(&queue, &cancel, reporter.as_ref()).await })
            })
            .collect();

        let drained = async {
            let joined = join_all(workers).await;
            // Fails a producer still waiting on a full queue nobody drains.
            queue.close();
            joined
        };
        let (produced, joined) = tokio::join!(producer, drained);

        let mut summary = PassSummary::default();
        match produced {
            Ok(enqueued) => summary.units_enqueued = enqueued,
            Err(e) => tracing::error!(error = %e, "Producer task panicked"),
        }

        for joined in joined {
            match joined {
                Ok(Ok(worker)) => summary.absorb(&worker),
                Ok(Err(e)) => tracing::error!(error = %e, "Worker failed to start"),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }

        self.transition(OrchestratorState::Drained);
        Ok(summary)
    }
}

/// Enqueue, in ascending order, every unit that still has pending pages.
/// Returns how many were enqueued before the queue closed.
async fn produce<K: Sink>(units: Vec<WorkUnit>, sink: K, queue: TaskQueue<WorkUnit>) -> u64 {
    let mut enqueued = 0;
    for unit in units {
        let pending = match sink.list_pending(&unit).await {
            Ok(pages) => !pages.is_empty(),
            Err(e) => {
                // Workers re-check each page, so enqueueing is always safe.
                tracing::warn!(%unit, error = %e, "Could not list pending pages");
                true
            }
        };
        if !pending {
            tracing::debug!(%unit, "Unit already complete");
            continue;
        }
        if let Err(e) = queue.enqueue(unit).await {
            tracing::warn!(%unit, enqueued, error = %e, "Producer stopped early");
            break;
        }
        enqueued += 1;
    }
    queue.close();
    enqueued
}

fn log_pass(summary: &PassSummary) {
    tracing::info!(
        units = summary.units_enqueued,
        pages_done = summary.pages_done,
        pages_skipped = summary.pages_skipped,
        pages_failed = summary.pages_failed,
        records = summary.records_upserted,
        "Pass finished"
    );
}
