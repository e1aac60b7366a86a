use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::AppError;
use crate::models::WorkUnit;
use crate::pipeline::{PageOutcome, PagePipeline};
use crate::queue::{Dequeued, TaskQueue};
use crate::session::SessionGuard;
use crate::traits::{Extractor, PageFetcher, ProxyStore, SessionProvider, Sink};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    UnitClaimed {
        worker_id: &'a str,
        unit: &'a WorkUnit,
    },
    PageSkipped {
        worker_id: &'a str,
        page: u64,
    },
    PageCompleted {
        worker_id: &'a str,
        page: u64,
        upserted: usize,
        unchanged: usize,
        skipped: usize,
    },
    PageIncomplete {
        worker_id: &'a str,
        page: u64,
        reason: &'a str,
    },
    PageFailed {
        worker_id: &'a str,
        page: u64,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
        reason: &'a str,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::UnitClaimed { worker_id, unit } => {
                tracing::info!(%worker_id, %unit, "Work unit claimed");
            }
            WorkerEvent::PageSkipped { worker_id, page } => {
                tracing::debug!(%worker_id, page, "Page already done");
            }
            WorkerEvent::PageCompleted {
                worker_id,
                page,
                upserted,
                unchanged,
                skipped,
            } => {
                tracing::info!(%worker_id, page, upserted, unchanged, skipped, "Page completed");
            }
            WorkerEvent::PageIncomplete {
                worker_id,
                page,
                reason,
            } => {
                tracing::warn!(%worker_id, page, %reason, "Page incomplete");
            }
            WorkerEvent::PageFailed {
                worker_id,
                page,
                error,
                will_retry,
            } => {
                tracing::warn!(%worker_id, page, %error, %will_retry, "Page failed");
            }
            WorkerEvent::ShuttingDown { worker_id, reason } => {
                tracing::info!(%worker_id, %reason, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// What one worker got through before exiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub units: u64,
    pub pages_done: u64,
    pub pages_skipped: u64,
    pub pages_failed: u64,
    pub records_upserted: u64,
}

/// Drains work units from the queue and runs each of their pages through
/// the pipeline, in ascending order, one page at a time.
pub struct WorkerService<F, S, E, K, P>
where
    F: PageFetcher,
    S: ProxyStore,
    E: Extractor,
    K: Sink,
    P: SessionProvider,
{
    pipeline: PagePipeline<F, S, E, K>,
    sessions: P,
    config: WorkerConfig,
}

impl<F, S, E, K, P> WorkerService<F, S, E, K, P>
where
    F: PageFetcher,
    S: ProxyStore + 'static,
    E: Extractor,
    K: Sink,
    P: SessionProvider,
{
    pub fn new(pipeline: PagePipeline<F, S, E, K>, sessions: P, config: WorkerConfig) -> Self {
        Self {
            pipeline,
            sessions,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until the queue is drained or closed, or `cancel` fires.
    ///
    /// The worker's session is held for the whole run and released on every
    /// exit path. Only a failure to open the session is returned as an
    /// error; page failures are reported and contained.
    pub async fn run<WR: WorkerReporter + ?Sized>(
        &self,
        queue: &TaskQueue<WorkUnit>,
        cancel: &CancellationToken,
        reporter: &WR,
    ) -> Result<WorkerSummary, AppError> {
        let worker_id = self.config.worker_id.as_str();
        reporter.report(WorkerEvent::Started { worker_id });

        let session = SessionGuard::acquire(&self.sessions, worker_id).await?;
        let mut summary = WorkerSummary::default();

        let reason = loop {
            if cancel.is_cancelled() {
                break "cancelled";
            }
            match queue.dequeue(self.config.worker_timeout).await {
                Dequeued::Item(unit) => {
                    reporter.report(WorkerEvent::UnitClaimed {
                        worker_id,
                        unit: &unit,
                    });
                    summary.units += 1;
                    self.process_unit(&unit, cancel, reporter, &mut summary).await;
                }
                Dequeued::TimedOut => break "queue drained",
                Dequeued::Closed => break "queue closed",
                Dequeued::Cancelled => break "cancelled",
            }
        };

        reporter.report(WorkerEvent::ShuttingDown { worker_id, reason });
        drop(session);
        reporter.report(WorkerEvent::Stopped { worker_id });

        Ok(summary)
    }

    async fn process_unit<WR: WorkerReporter + ?Sized>(
        &self,
        unit: &WorkUnit,
        cancel: &CancellationToken,
        reporter: &WR,
        summary: &mut WorkerSummary,
    ) {
        let worker_id = self.config.worker_id.as_str();

        for page in unit.pages() {
            if cancel.is_cancelled() {
                return;
            }

            match self.pipeline.process_page(page, unit.page_size).await {
                Ok(PageOutcome::AlreadyDone) => {
                    summary.pages_skipped += 1;
                    reporter.report(WorkerEvent::PageSkipped { worker_id, page });
                }
                Ok(PageOutcome::Done(report)) => {
                    summary.pages_done += 1;
                    summary.records_upserted += report.upserted as u64;
                    reporter.report(WorkerEvent::PageCompleted {
                        worker_id,
                        page,
                        upserted: report.upserted,
                        unchanged: report.unchanged,
                        skipped: report.skipped,
                    });
                }
                Ok(PageOutcome::Incomplete { reason, report }) => {
                    summary.pages_failed += 1;
                    summary.records_upserted += report.upserted as u64;
                    reporter.report(WorkerEvent::PageIncomplete {
                        worker_id,
                        page,
                        reason: &reason,
                    });
                }
                Err(AppError::Cancelled) => return,
                Err(e) => {
                    summary.pages_failed += 1;
                    let error = e.to_string();
                    reporter.report(WorkerEvent::PageFailed {
                        worker_id,
                        page,
                        error: &error,
                        will_retry: !e.is_skippable(),
                    });
                }
            }
        }
    }
}
