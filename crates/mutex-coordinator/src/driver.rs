//! Driver - starts N workers against one coordinator and waits for them.
//!
//! Each worker runs as its own tokio task with a child of the run's
//! cancellation token, so a single worker or the whole run can be cancelled.
//! Cancellation only has an effect on workers still waiting for admission.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfigError, CoordinatorConfig};
use crate::coordinator::Coordinator;
use crate::section::{CriticalSection, CriticalWork, SimulatedWork, WorkerReport};
use crate::trace::{Trace, TraceViolation};
use crate::worker::{WorkerId, WorkerState};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: WorkerId },
    #[error("worker {worker} task was aborted")]
    WorkerAborted { worker: WorkerId },
}

/// Summary of one run, suitable for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// RFC 3339.
    pub started_at: String,
    /// RFC 3339.
    pub completed_at: String,
    pub workers: Vec<WorkerReport>,
    pub admission_order: Vec<WorkerId>,
    #[serde(skip)]
    pub trace: Trace,
}

impl RunReport {
    pub fn worker(&self, id: WorkerId) -> Option<&WorkerReport> {
        self.workers.iter().find(|r| r.worker == id)
    }

    pub fn completed(&self) -> Vec<WorkerId> {
        self.with_state(WorkerState::Done)
    }

    pub fn cancelled(&self) -> Vec<WorkerId> {
        self.with_state(WorkerState::Cancelled)
    }

    /// Check the recorded trace for mutual exclusion and self-release.
    pub fn verify(&self) -> Result<(), TraceViolation> {
        self.trace.verify()
    }

    fn with_state(&self, state: WorkerState) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.worker)
            .collect()
    }
}

struct WorkerHandle {
    worker: WorkerId,
    cancel: CancellationToken,
    task: JoinHandle<WorkerReport>,
}

/// Handle to a started run for cancellation and waiting.
pub struct RunHandle {
    run_id: Uuid,
    started_at: String,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
}

impl RunHandle {
    pub fn workers(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|h| h.worker).collect()
    }

    /// Cancel one worker. Returns false for an unknown id.
    pub fn cancel(&self, worker: WorkerId) -> bool {
        match self.workers.iter().find(|h| h.worker == worker) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Wait until every worker is `Done` or `Cancelled`.
    pub async fn wait(self) -> Result<RunReport, DriverError> {
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut failure = None;

        for handle in self.workers {
            match handle.task.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let worker = handle.worker;
                    tracing::error!(%worker, error = %e, "Worker task failed");
                    let err = if e.is_panic() {
                        DriverError::WorkerPanicked { worker }
                    } else {
                        DriverError::WorkerAborted { worker }
                    };
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let trace = self.coordinator.trace();
        let report = RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            completed_at: Utc::now().to_rfc3339(),
            admission_order: trace.admission_order(),
            workers: reports,
            trace,
        };

        tracing::info!(
            run_id = %report.run_id,
            completed = report.completed().len(),
            cancelled = report.cancelled().len(),
            "All workers finished"
        );
        Ok(report)
    }
}

pub struct Driver {
    coordinator: Arc<Coordinator>,
    work: Arc<dyn CriticalWork>,
    workers: Vec<WorkerId>,
}

impl Driver {
    /// Driver whose workers each hold the critical section for `config.hold`.
    pub fn new(config: &CoordinatorConfig) -> Result<Self, DriverError> {
        Self::with_work(config, Arc::new(SimulatedWork::new(config.hold)))
    }

    pub fn with_work(
        config: &CoordinatorConfig,
        work: Arc<dyn CriticalWork>,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        Ok(Self {
            coordinator: Arc::new(Coordinator::new()),
            work,
            workers: config.worker_ids(),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Start every worker. Must be called within a tokio runtime.
    pub fn spawn(&self) -> RunHandle {
        let run_id = Uuid::new_v4();
        let shutdown = CancellationToken::new();
        tracing::info!(%run_id, workers = self.workers.len(), "Starting workers");

        let workers = self
            .workers
            .iter()
            .map(|&worker| {
                let cancel = shutdown.child_token();
                let task = {
                    let coordinator = Arc::clone(&self.coordinator);
                    let work = Arc::clone(&self.work);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        CriticalSection::new(worker, coordinator)
                            .run(work.as_ref(), &cancel)
                            .await
                    })
                };
                WorkerHandle {
                    worker,
                    cancel,
                    task,
                }
            })
            .collect();

        RunHandle {
            run_id,
            started_at: Utc::now().to_rfc3339(),
            coordinator: Arc::clone(&self.coordinator),
            shutdown,
            workers,
        }
    }

    /// Start every worker and wait for all of them.
    pub async fn run_to_completion(&self) -> Result<RunReport, DriverError> {
        self.spawn().wait().await
    }
}
