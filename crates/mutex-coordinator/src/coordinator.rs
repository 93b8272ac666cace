//! Coordinator - owns the admission queue and the exclusion gate.
//!
//! Workers share one `Arc<Coordinator>` and only touch the two primitives
//! through it:
//! 1. `request_admission` → `AdmissionTicket`
//! 2. `enter(ticket)` → `Residency` (a ticket is required to even try)
//! 3. `leave(residency)` frees the gate and vacates the slot
//!
//! Step 3 runs under the observer lock, so `peek_resident` and `snapshot`
//! never see the gate free while the slot is still held by the leaver. A
//! `Residency` dropped without `leave` releases both under the same lock.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionQueue, AdmissionTicket};
use crate::error::{CoordinatorError, fatal};
use crate::gate::{ExclusionGate, GateGuard};
use crate::trace::{Trace, TraceEvent, TransitionLog};
use crate::worker::{WorkerId, WorkerState};

/// Consistent view of both shared resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub resident: Option<WorkerId>,
    /// Last state recorded for the resident.
    pub resident_state: Option<WorkerState>,
    pub gate_holder: Option<WorkerId>,
}

impl Occupancy {
    pub fn is_idle(&self) -> bool {
        self.resident.is_none() && self.gate_holder.is_none()
    }
}

/// A worker's hold on the admission slot and, once entered, the gate.
#[must_use = "dropping a Residency releases the gate and the admission slot"]
#[derive(Debug)]
pub struct Residency<'a> {
    coordinator: &'a Coordinator,
    worker: WorkerId,
    ticket: Option<AdmissionTicket<'a>>,
    guard: Option<GateGuard<'a>>,
}

impl Residency<'_> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for Residency<'_> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        tracing::error!(worker = %self.worker, "Residency dropped without leave - releasing gate and slot");

        let worker = self.worker;
        let coordinator = self.coordinator;
        let mut from = WorkerState::InCriticalSection;
        let released = coordinator.release(self.guard.take(), ticket, |to| {
            coordinator.record_transition(worker, from, to);
            from = to;
        });
        if let Err(e) = released {
            fatal(e);
        }
    }
}

#[derive(Debug)]
pub struct Coordinator {
    admission: AdmissionQueue,
    gate: ExclusionGate,
    trace: TransitionLog,
    observers: RwLock<()>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            admission: AdmissionQueue::new(),
            gate: ExclusionGate::new(),
            trace: TransitionLog::new(),
            observers: RwLock::new(()),
        }
    }

    /// Block until `worker` is the admission resident, or `cancel` fires.
    pub async fn request_admission(
        &self,
        worker: WorkerId,
        cancel: &CancellationToken,
    ) -> Result<AdmissionTicket<'_>, CoordinatorError> {
        let ticket = self.admission.request_admission(worker, cancel).await?;
        self.trace.record(TraceEvent::SlotFilled { worker });
        Ok(ticket)
    }

    /// Acquire the gate for the worker that owns `ticket`.
    ///
    /// If this future is dropped while waiting, the slot is vacated.
    pub async fn enter<'a>(
        &'a self,
        ticket: AdmissionTicket<'a>,
    ) -> Result<Residency<'a>, CoordinatorError> {
        let worker = ticket.worker();
        let mut residency = Residency {
            coordinator: self,
            worker,
            ticket: Some(ticket),
            guard: None,
        };
        residency.guard = Some(self.gate.enter(worker).await?);
        Ok(residency)
    }

    /// Free the gate, then vacate the admission slot, as one step for observers.
    ///
    /// `on_step` is called with `ExitingGate`, `ReleasingAdmission` and `Done`
    /// as the leaver passes each point. `Done` is reported before slot
    /// capacity is handed to the next waiter.
    pub fn leave(
        &self,
        mut residency: Residency<'_>,
        on_step: impl FnMut(WorkerState),
    ) -> Result<WorkerId, CoordinatorError> {
        let worker = residency.worker;
        let (Some(guard), Some(ticket)) = (residency.guard.take(), residency.ticket.take()) else {
            return Err(CoordinatorError::invariant(format!(
                "worker {worker} left without holding the gate"
            )));
        };
        self.release(Some(guard), ticket, on_step)
    }

    /// Current admission resident. Observability only.
    pub fn peek_resident(&self) -> Option<WorkerId> {
        let _observe = self.read_observers();
        self.admission.peek_resident()
    }

    pub fn snapshot(&self) -> Occupancy {
        let _observe = self.read_observers();
        let resident = self.admission.peek_resident();
        Occupancy {
            resident,
            resident_state: resident.and_then(|worker| self.trace.last_state(worker)),
            gate_holder: self.gate.holder(),
        }
    }

    pub fn record_transition(&self, worker: WorkerId, from: WorkerState, to: WorkerState) {
        self.trace.record(TraceEvent::Transition { worker, from, to });
    }

    pub fn trace(&self) -> Trace {
        self.trace.snapshot()
    }

    /// Gate exit (when held) and slot removal under the observer write lock.
    ///
    /// `Done` is only reported when the gate was held, since a worker still
    /// entering has no legal path to it.
    fn release(
        &self,
        guard: Option<GateGuard<'_>>,
        ticket: AdmissionTicket<'_>,
        mut on_step: impl FnMut(WorkerState),
    ) -> Result<WorkerId, CoordinatorError> {
        let worker = ticket.worker();
        let _quiesce = self.write_observers();

        let held_gate = guard.is_some();
        if let Some(guard) = guard {
            on_step(WorkerState::ExitingGate);
            self.gate.exit(guard)?;
            on_step(WorkerState::ReleasingAdmission);
        }
        self.admission.release_admission_with(ticket, |resident| {
            self.trace.record(TraceEvent::SlotVacated {
                by: worker,
                resident,
            });
            if held_gate {
                on_step(WorkerState::Done);
            }
        })
    }

    fn read_observers(&self) -> RwLockReadGuard<'_, ()> {
        self.observers.read().unwrap_or_else(|poisoned| {
            tracing::error!("Coordinator observer lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn write_observers(&self) -> RwLockWriteGuard<'_, ()> {
        self.observers.write().unwrap_or_else(|poisoned| {
            tracing::error!("Coordinator observer lock poisoned - recovering");
            poisoned.into_inner()
        })
    }
}
