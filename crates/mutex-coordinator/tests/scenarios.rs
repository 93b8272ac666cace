//! End-to-end runs of the coordinator through the driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mutex_coordinator::{
    CoordinatorConfig, CriticalWork, Driver, WorkError, WorkerId, WorkerState,
};
use tokio::sync::{Semaphore, mpsc};

fn config(workers: usize, hold_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_workers(workers)
        .with_hold(Duration::from_millis(hold_ms))
}

/// Counts how many workers are inside the body at once.
#[derive(Default)]
struct OccupancyCounter {
    inside: AtomicUsize,
    max_inside: AtomicUsize,
    visits: AtomicUsize,
}

#[async_trait]
impl CriticalWork for OccupancyCounter {
    async fn run(&self, _worker: WorkerId) -> Result<(), WorkError> {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3)).await;
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.visits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Reports each entrant and holds the section until the test lets it go.
struct HeldWork {
    entered: mpsc::UnboundedSender<WorkerId>,
    release: Semaphore,
}

impl HeldWork {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerId>) {
        let (entered, rx) = mpsc::unbounded_channel();
        let work = Arc::new(Self {
            entered,
            release: Semaphore::new(0),
        });
        (work, rx)
    }
}

#[async_trait]
impl CriticalWork for HeldWork {
    async fn run(&self, worker: WorkerId) -> Result<(), WorkError> {
        let _ = self.entered.send(worker);
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| WorkError::failed(e.to_string()))?;
        permit.forget();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reference_scenario_three_workers() {
    let driver = Driver::new(&config(3, 50)).unwrap();
    let report = driver.run_to_completion().await.unwrap();

    let ids = [WorkerId::new(1), WorkerId::new(2), WorkerId::new(3)];
    assert_eq!(report.completed().len(), 3);
    for id in ids {
        let worker = report.worker(id).unwrap();
        assert_eq!(worker.state, WorkerState::Done);
        assert_eq!(worker.observed_resident, Some(id));
        assert_eq!(worker.released, Some(id));
    }

    // Entry/exit pairs never interleave.
    let mut intervals = report.trace.critical_intervals();
    assert_eq!(intervals.len(), 3);
    intervals.sort_by_key(|(_, entered, _)| *entered);
    for pair in intervals.windows(2) {
        let (_, _, left) = pair[0];
        let (_, next_entered, _) = pair[1];
        assert!(left.unwrap() < next_entered, "{intervals:?}");
    }

    let mut admitted = report.admission_order.clone();
    admitted.sort();
    assert_eq!(admitted, ids.to_vec());
    assert!(report.verify().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn body_never_runs_concurrently() {
    let counter = Arc::new(OccupancyCounter::default());
    let driver = Driver::with_work(&config(8, 0), Arc::clone(&counter) as Arc<dyn CriticalWork>).unwrap();

    let report = driver.run_to_completion().await.unwrap();

    assert_eq!(counter.visits.load(Ordering::SeqCst), 8);
    assert_eq!(counter.max_inside.load(Ordering::SeqCst), 1);
    assert!(report.trace.check_mutual_exclusion().is_ok());
    assert_eq!(report.trace.max_admission_holders(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_worker_finishes_for_any_count() {
    for workers in 1..=8 {
        let driver = Driver::new(&config(workers, 1)).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), driver.run_to_completion())
            .await
            .unwrap_or_else(|_| panic!("run with {workers} workers did not finish"))
            .unwrap();
        assert_eq!(report.completed().len(), workers);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slot_is_always_released_by_its_owner() {
    let driver = Driver::new(&config(6, 2)).unwrap();
    let report = driver.run_to_completion().await.unwrap();

    assert!(report.trace.check_self_release().is_ok());
    for worker in &report.workers {
        assert_eq!(worker.released, Some(worker.worker));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_waiter_does_not_block_others() {
    let (work, mut entered) = HeldWork::new();
    let driver = Driver::with_work(&config(3, 0), Arc::clone(&work) as Arc<dyn CriticalWork>).unwrap();
    let handle = driver.spawn();

    let first = entered.recv().await.unwrap();
    let victim = handle
        .workers()
        .into_iter()
        .find(|w| *w != first)
        .unwrap();
    assert!(handle.cancel(victim));

    // Let the holder and the remaining waiter through.
    work.release.add_permits(2);
    let report = handle.wait().await.unwrap();

    assert_eq!(report.cancelled(), vec![victim]);
    assert_eq!(report.completed().len(), 2);
    assert_eq!(
        report.trace.states_of(victim),
        vec![WorkerState::RequestingAdmission, WorkerState::Cancelled]
    );
    assert!(!report.admission_order.contains(&victim));
    assert!(report.trace.critical_intervals().iter().all(|(w, _, _)| *w != victim));
    assert!(report.verify().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_all_spares_the_admitted_worker() {
    let (work, mut entered) = HeldWork::new();
    let driver = Driver::with_work(&config(4, 0), Arc::clone(&work) as Arc<dyn CriticalWork>).unwrap();
    let handle = driver.spawn();

    let first = entered.recv().await.unwrap();
    handle.cancel_all();
    work.release.add_permits(1);

    let report = handle.wait().await.unwrap();
    assert_eq!(report.completed(), vec![first]);
    assert_eq!(report.cancelled().len(), 3);
    assert_eq!(report.admission_order, vec![first]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn observers_never_see_a_half_finished_leave() {
    let driver = Driver::new(&config(6, 1)).unwrap();
    let coordinator = Arc::clone(driver.coordinator());
    let stop = Arc::new(AtomicBool::new(false));

    let observers: Vec<_> = (0..2)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut samples = 0usize;
                while !stop.load(Ordering::SeqCst) {
                    let seen = coordinator.snapshot();
                    if let Some(holder) = seen.gate_holder {
                        assert_eq!(seen.resident, Some(holder), "{seen:?}");
                    }
                    // Leaving is one step: the resident is never seen mid-exit.
                    assert!(
                        !matches!(
                            seen.resident_state,
                            Some(WorkerState::ExitingGate | WorkerState::ReleasingAdmission)
                        ),
                        "{seen:?}"
                    );
                    samples += 1;
                    tokio::task::yield_now().await;
                }
                samples
            })
        })
        .collect();

    let report = driver.run_to_completion().await.unwrap();
    stop.store(true, Ordering::SeqCst);

    for observer in observers {
        assert!(observer.await.unwrap() > 0);
    }
    assert_eq!(report.completed().len(), 6);
}
