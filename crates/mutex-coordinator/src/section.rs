//! Critical-section wrapper - one worker's single pass through shared state.
//!
//! Flow:
//! 1. Announce intent, wait for admission (cancellable)
//! 2. Acquire the gate
//! 3. Run the protected work
//! 4. Leave: free the gate and vacate the slot
//!
//! A worker cancelled during step 1 ends in `Cancelled` and never touches the
//! gate or the slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::error::{CoordinatorError, fatal};
use crate::worker::{WorkerId, WorkerState};

/// Failure of the protected body. The worker still leaves cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("critical work failed: {0}")]
    Failed(String),
}

impl WorkError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The body executed while holding the gate.
///
/// Must be bounded and must not request the gate again.
#[async_trait]
pub trait CriticalWork: Send + Sync + 'static {
    async fn run(&self, worker: WorkerId) -> Result<(), WorkError>;
}

/// Holds the critical section for a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWork {
    duration: Duration,
}

impl SimulatedWork {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl CriticalWork for SimulatedWork {
    async fn run(&self, _worker: WorkerId) -> Result<(), WorkError> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Outcome of one worker's pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: WorkerId,
    pub state: WorkerState,
    /// Resident seen from inside the critical section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_resident: Option<WorkerId>,
    /// Identifier removed from the admission slot on leave.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives one worker through the admission/exclusion protocol.
pub struct CriticalSection {
    worker: WorkerId,
    state: WorkerState,
    coordinator: Arc<Coordinator>,
}

impl CriticalSection {
    pub fn new(worker: WorkerId, coordinator: Arc<Coordinator>) -> Self {
        Self {
            worker,
            state: WorkerState::Idle,
            coordinator,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn run(mut self, work: &dyn CriticalWork, cancel: &CancellationToken) -> WorkerReport {
        let coordinator = Arc::clone(&self.coordinator);

        self.advance(WorkerState::RequestingAdmission);
        let ticket = match coordinator.request_admission(self.worker, cancel).await {
            Ok(ticket) => ticket,
            Err(CoordinatorError::Cancelled { .. }) => {
                self.advance(WorkerState::Cancelled);
                return self.report(None, None, None);
            }
            Err(e) => fatal(e),
        };
        self.advance(WorkerState::Admitted);

        self.advance(WorkerState::EnteringGate);
        // Dropped on unwind, the residency still frees the gate and the slot.
        let residency = coordinator.enter(ticket).await.unwrap_or_else(|e| fatal(e));
        self.advance(WorkerState::InCriticalSection);

        let observed = coordinator.peek_resident();
        tracing::debug!(worker = %self.worker, resident = ?observed, "Resident observed inside critical section");

        let error = match work.run(self.worker).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(worker = %self.worker, error = %e, "Critical work failed");
                Some(e.to_string())
            }
        };

        let released = coordinator
            .leave(residency, |step| self.advance(step))
            .unwrap_or_else(|e| fatal(e));

        self.report(observed, Some(released), error)
    }

    fn advance(&mut self, next: WorkerState) {
        if !self.state.can_transition_to(next) {
            fatal(CoordinatorError::invariant(format!(
                "worker {} cannot move from {} to {}",
                self.worker, self.state, next
            )));
        }
        self.coordinator.record_transition(self.worker, self.state, next);
        self.state = next;

        let worker = self.worker;
        match next {
            WorkerState::RequestingAdmission => {
                tracing::info!(%worker, "Worker requests admission");
            }
            WorkerState::InCriticalSection => {
                tracing::info!(%worker, "Worker in critical section");
            }
            WorkerState::ExitingGate => {
                tracing::info!(%worker, "Worker leaves critical section");
            }
            WorkerState::Cancelled => {
                tracing::info!(%worker, "Worker cancelled while waiting for admission");
            }
            other => {
                tracing::debug!(%worker, state = %other, "Worker transition");
            }
        }
    }

    fn report(
        &self,
        observed_resident: Option<WorkerId>,
        released: Option<WorkerId>,
        error: Option<String>,
    ) -> WorkerReport {
        WorkerReport {
            worker: self.worker,
            state: self.state,
            observed_resident,
            released,
            error,
        }
    }
}
