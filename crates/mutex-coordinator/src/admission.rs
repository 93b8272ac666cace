//! Admission queue: a blocking, capacity-1 slot of worker identifiers.
//!
//! Capacity is a single permit of a FIFO-fair [`Semaphore`], so workers
//! blocked on [`AdmissionQueue::request_admission`] are admitted strictly in
//! the order they started waiting.
//!
//! Admission uses a ticket to enforce ownership:
//! - `request_admission` → `AdmissionTicket` (the only way to get one)
//! - `release_admission(ticket)` consumes it, so a slot is vacated at most once
//! - a ticket dropped without release vacates the slot and logs an error

use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordinatorError, fatal};
use crate::worker::WorkerId;

/// Proof that a worker is the current admission resident.
#[must_use = "dropping an AdmissionTicket vacates the admission slot"]
#[derive(Debug)]
pub struct AdmissionTicket<'a> {
    queue: &'a AdmissionQueue,
    worker: WorkerId,
    released: bool,
}

impl AdmissionTicket<'_> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for AdmissionTicket<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::error!(worker = %self.worker, "AdmissionTicket dropped without release - vacating slot");
        self.released = true;
        if let Err(e) = self.queue.vacate(self.worker, |_| {}) {
            fatal(e);
        }
    }
}

/// Bounded, blocking admission queue with a fixed capacity of one.
#[derive(Debug)]
pub struct AdmissionQueue {
    capacity: Semaphore,
    resident: StdMutex<Option<WorkerId>>,
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionQueue {
    pub const CAPACITY: usize = 1;

    pub fn new() -> Self {
        Self {
            capacity: Semaphore::new(Self::CAPACITY),
            resident: StdMutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    /// Wait for free capacity, then record `worker` as the sole resident.
    ///
    /// Returns `Cancelled` if `cancel` fires first, including when it was
    /// already cancelled on entry. No resident is recorded in that case.
    pub async fn request_admission(
        &self,
        worker: WorkerId,
        cancel: &CancellationToken,
    ) -> Result<AdmissionTicket<'_>, CoordinatorError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(%worker, "Admission wait cancelled");
                return Err(CoordinatorError::Cancelled { worker });
            }
            permit = self.capacity.acquire() => permit
                .map_err(|_| CoordinatorError::invariant("admission capacity closed"))?,
        };
        // Capacity comes back in `vacate`, not on permit drop.
        permit.forget();
        self.occupy(worker)
    }

    /// Non-blocking admission. `Ok(None)` when the slot is occupied.
    pub fn try_request_admission(
        &self,
        worker: WorkerId,
    ) -> Result<Option<AdmissionTicket<'_>>, CoordinatorError> {
        let Ok(permit) = self.capacity.try_acquire() else {
            return Ok(None);
        };
        permit.forget();
        self.occupy(worker).map(Some)
    }

    /// Current resident, without removing it.
    pub fn peek_resident(&self) -> Option<WorkerId> {
        *self.lock_resident()
    }

    pub fn is_occupied(&self) -> bool {
        self.peek_resident().is_some()
    }

    /// Remove the resident recorded by `ticket` and return it.
    ///
    /// The ticket proves a resident exists, so this never waits.
    pub fn release_admission(&self, ticket: AdmissionTicket<'_>) -> Result<WorkerId, CoordinatorError> {
        self.release_admission_with(ticket, |_| {})
    }

    /// Like [`release_admission`](Self::release_admission), but runs
    /// `before_vacancy` after the resident is removed and before capacity is
    /// handed to the next waiter.
    pub fn release_admission_with(
        &self,
        mut ticket: AdmissionTicket<'_>,
        before_vacancy: impl FnOnce(WorkerId),
    ) -> Result<WorkerId, CoordinatorError> {
        if !std::ptr::eq(ticket.queue, self) {
            // Dropping the ticket vacates the queue that issued it.
            return Err(CoordinatorError::invariant(format!(
                "worker {} released a ticket issued by another queue",
                ticket.worker
            )));
        }
        ticket.released = true;
        self.vacate(ticket.worker, before_vacancy)
    }

    fn occupy(&self, worker: WorkerId) -> Result<AdmissionTicket<'_>, CoordinatorError> {
        let mut resident = self.lock_resident();
        if let Some(other) = *resident {
            return Err(CoordinatorError::invariant(format!(
                "worker {worker} admitted while worker {other} is resident"
            )));
        }
        *resident = Some(worker);
        drop(resident);

        tracing::trace!(%worker, "Admission slot filled");
        Ok(AdmissionTicket {
            queue: self,
            worker,
            released: false,
        })
    }

    fn vacate(
        &self,
        worker: WorkerId,
        before_vacancy: impl FnOnce(WorkerId),
    ) -> Result<WorkerId, CoordinatorError> {
        {
            let mut resident = self.lock_resident();
            match *resident {
                Some(id) if id == worker => *resident = None,
                Some(id) => {
                    return Err(CoordinatorError::invariant(format!(
                        "worker {worker} tried to remove slot owned by worker {id}"
                    )));
                }
                None => {
                    return Err(CoordinatorError::invariant(format!(
                        "worker {worker} tried to remove an empty slot"
                    )));
                }
            }
        }

        before_vacancy(worker);
        self.capacity.add_permits(1);
        tracing::trace!(%worker, "Admission slot vacated");
        Ok(worker)
    }

    fn lock_resident(&self) -> MutexGuard<'_, Option<WorkerId>> {
        self.resident.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Admission slot mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}
