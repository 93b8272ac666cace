//! Exclusion gate guarding the critical-section body.
//!
//! Acquisition is scoped: [`ExclusionGate::enter`] returns a [`GateGuard`]
//! and the gate is free again as soon as the guard is dropped, whether by
//! [`ExclusionGate::exit`], an early return, cancellation of the enclosing
//! future, or a panic in the protected body.
//!
//! The gate is not reentrant. A holder that calls `enter` again waits on
//! itself forever.

use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use tokio::sync::Mutex;

use crate::error::{CoordinatorError, fatal};
use crate::worker::WorkerId;

/// Held gate. Dropping it frees the gate.
#[must_use = "the gate is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a ExclusionGate,
    worker: WorkerId,
    // Unlocks after `Drop::drop` has cleared the holder.
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl GateGuard<'_> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.gate.lock_holder();
        if *holder != Some(self.worker) {
            let recorded = *holder;
            drop(holder);
            fatal(CoordinatorError::invariant(format!(
                "worker {} released the gate recorded as held by {recorded:?}",
                self.worker
            )));
        }
        *holder = None;
    }
}

/// Binary mutual-exclusion lock: free, or held by exactly one worker.
///
/// Waiters are served in FIFO order.
#[derive(Debug, Default)]
pub struct ExclusionGate {
    lock: Mutex<()>,
    holder: StdMutex<Option<WorkerId>>,
}

impl ExclusionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the gate is free, then hold it on behalf of `worker`.
    pub async fn enter(&self, worker: WorkerId) -> Result<GateGuard<'_>, CoordinatorError> {
        let lock = self.lock.lock().await;
        self.mark_held(worker, lock)
    }

    /// Non-blocking [`enter`](Self::enter). `Ok(None)` when the gate is held.
    pub fn try_enter(&self, worker: WorkerId) -> Result<Option<GateGuard<'_>>, CoordinatorError> {
        match self.lock.try_lock() {
            Ok(lock) => self.mark_held(worker, lock).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Free the gate. Returns the worker that held it.
    ///
    /// A guard issued by another gate is rejected; it still frees its own
    /// gate when dropped.
    pub fn exit(&self, guard: GateGuard<'_>) -> Result<WorkerId, CoordinatorError> {
        if !std::ptr::eq(guard.gate, self) {
            return Err(CoordinatorError::invariant(format!(
                "worker {} exited with a guard from another gate",
                guard.worker
            )));
        }
        let worker = guard.worker;
        drop(guard);
        Ok(worker)
    }

    pub fn holder(&self) -> Option<WorkerId> {
        *self.lock_holder()
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }

    fn mark_held<'a>(
        &'a self,
        worker: WorkerId,
        lock: tokio::sync::MutexGuard<'a, ()>,
    ) -> Result<GateGuard<'a>, CoordinatorError> {
        {
            let mut holder = self.lock_holder();
            if let Some(other) = *holder {
                return Err(CoordinatorError::invariant(format!(
                    "worker {worker} entered the gate while worker {other} holds it"
                )));
            }
            *holder = Some(worker);
        }
        Ok(GateGuard {
            gate: self,
            worker,
            _lock: lock,
        })
    }

    fn lock_holder(&self) -> MutexGuard<'_, Option<WorkerId>> {
        self.holder.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Gate holder mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn id(n: u64) -> WorkerId {
        WorkerId::new(n)
    }

    #[tokio::test]
    async fn enter_marks_holder_and_exit_frees() {
        let gate = ExclusionGate::new();
        assert!(!gate.is_held());

        let guard = gate.enter(id(1)).await.unwrap();
        assert_eq!(gate.holder(), Some(id(1)));
        assert_eq!(guard.worker(), id(1));

        assert_eq!(gate.exit(guard).unwrap(), id(1));
        assert_eq!(gate.holder(), None);
    }

    #[tokio::test]
    async fn second_worker_waits_for_exit() {
        let gate = Arc::new(ExclusionGate::new());
        let guard = gate.enter(id(1)).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let guard = gate.enter(id(2)).await.unwrap();
                gate.exit(guard).unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.holder(), Some(id(1)));

        gate.exit(guard).unwrap();
        assert_eq!(waiter.await.unwrap(), id(2));
        assert!(!gate.is_held());
    }

    #[tokio::test]
    async fn try_enter_fails_while_held() {
        let gate = ExclusionGate::new();
        let guard = gate.try_enter(id(1)).unwrap().unwrap();
        assert!(gate.try_enter(id(2)).unwrap().is_none());
        drop(guard);
        assert!(gate.try_enter(id(2)).unwrap().is_some());
    }

    #[tokio::test]
    async fn reentry_by_holder_never_completes() {
        let gate = ExclusionGate::new();
        let _guard = gate.enter(id(1)).await.unwrap();

        assert!(gate.try_enter(id(1)).unwrap().is_none());
        let reentry = tokio::time::timeout(Duration::from_millis(30), gate.enter(id(1))).await;
        assert!(reentry.is_err());
        assert_eq!(gate.holder(), Some(id(1)));
    }

    fn failing_body() {
        panic!("protected body failed");
    }

    #[tokio::test]
    async fn panic_in_body_releases_gate() {
        let gate = Arc::new(ExclusionGate::new());

        let task = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _guard = gate.enter(id(1)).await.unwrap();
                failing_body();
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert!(!gate.is_held());
        assert!(gate.try_enter(id(2)).unwrap().is_some());
    }

    #[tokio::test]
    async fn abandoned_enter_does_not_hold_gate() {
        let gate = ExclusionGate::new();
        let guard = gate.enter(id(1)).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(20), gate.enter(id(2))).await;
        assert!(waited.is_err());

        gate.exit(guard).unwrap();
        assert!(!gate.is_held());
        assert!(gate.try_enter(id(3)).unwrap().is_some());
    }

    #[tokio::test]
    async fn exit_with_guard_from_another_gate_is_rejected() {
        let gate = ExclusionGate::new();
        let other = ExclusionGate::new();
        let guard = other.enter(id(1)).await.unwrap();

        let err = gate.exit(guard).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvariantViolation(_)));
        // The rejected guard was dropped and freed the gate it came from.
        assert!(!other.is_held());
        assert!(!gate.is_held());
    }
}
