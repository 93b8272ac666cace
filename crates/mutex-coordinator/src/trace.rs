//! Totally ordered record of worker transitions and admission slot changes.
//!
//! Every entry gets a sequence number under one lock, so the order of the
//! log is the order in which the recording workers passed their recording
//! points. The coordinator records transitions at points where the
//! protecting primitive is still held, which makes the log usable for
//! checking mutual exclusion after the fact.

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use serde::Serialize;

use crate::worker::{WorkerId, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Transition {
        worker: WorkerId,
        from: WorkerState,
        to: WorkerState,
    },
    SlotFilled {
        worker: WorkerId,
    },
    SlotVacated {
        by: WorkerId,
        resident: WorkerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// A property of the run that the trace shows was broken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceViolation {
    #[error("seq {seq}: worker {entered} entered the critical section while worker {inside} was inside")]
    Overlap {
        seq: u64,
        inside: WorkerId,
        entered: WorkerId,
    },
    #[error("seq {seq}: worker {worker} filled the admission slot while worker {resident} was resident")]
    DoubleAdmission {
        seq: u64,
        resident: WorkerId,
        worker: WorkerId,
    },
    #[error("seq {seq}: worker {by} vacated the admission slot filled by {filled_by:?}")]
    ForeignRelease {
        seq: u64,
        by: WorkerId,
        filled_by: Option<WorkerId>,
    },
}

/// Append-only, shared trace recorder.
#[derive(Debug, Default)]
pub struct TransitionLog {
    entries: StdMutex<Vec<TraceEntry>>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: TraceEvent) -> u64 {
        let mut entries = self.lock_entries();
        let seq = entries.len() as u64;
        entries.push(TraceEntry { seq, event });
        seq
    }

    pub fn snapshot(&self) -> Trace {
        Trace {
            entries: self.lock_entries().clone(),
        }
    }

    /// Most recent state recorded for `worker`.
    pub fn last_state(&self, worker: WorkerId) -> Option<WorkerState> {
        self.lock_entries().iter().rev().find_map(|entry| match entry.event {
            TraceEvent::Transition { worker: w, to, .. } if w == worker => Some(to),
            _ => None,
        })
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<TraceEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Trace mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

/// Immutable copy of a [`TransitionLog`] with property checks.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    fn transitions(&self) -> impl Iterator<Item = (u64, WorkerId, WorkerState, WorkerState)> + '_ {
        self.entries.iter().filter_map(|entry| match entry.event {
            TraceEvent::Transition { worker, from, to } => Some((entry.seq, worker, from, to)),
            _ => None,
        })
    }

    /// States `worker` moved into, in order.
    pub fn states_of(&self, worker: WorkerId) -> Vec<WorkerState> {
        self.transitions()
            .filter(|(_, w, _, _)| *w == worker)
            .map(|(_, _, _, to)| to)
            .collect()
    }

    /// Order in which workers filled the admission slot.
    pub fn admission_order(&self) -> Vec<WorkerId> {
        self.entries
            .iter()
            .filter_map(|entry| match entry.event {
                TraceEvent::SlotFilled { worker } => Some(worker),
                _ => None,
            })
            .collect()
    }

    /// `(worker, entered_seq, left_seq)` for every critical-section visit.
    ///
    /// `left_seq` is `None` if the worker never reached `ExitingGate`.
    pub fn critical_intervals(&self) -> Vec<(WorkerId, u64, Option<u64>)> {
        let mut intervals: Vec<(WorkerId, u64, Option<u64>)> = Vec::new();
        for (seq, worker, _, to) in self.transitions() {
            match to {
                WorkerState::InCriticalSection => intervals.push((worker, seq, None)),
                WorkerState::ExitingGate => {
                    if let Some(open) = intervals
                        .iter_mut()
                        .rev()
                        .find(|(w, _, left)| *w == worker && left.is_none())
                    {
                        open.2 = Some(seq);
                    }
                }
                _ => {}
            }
        }
        intervals
    }

    /// No two workers are ever `InCriticalSection` at the same time.
    pub fn check_mutual_exclusion(&self) -> Result<(), TraceViolation> {
        let mut inside: Option<WorkerId> = None;
        for (seq, worker, from, to) in self.transitions() {
            if to == WorkerState::InCriticalSection {
                if let Some(inside) = inside {
                    return Err(TraceViolation::Overlap {
                        seq,
                        inside,
                        entered: worker,
                    });
                }
                inside = Some(worker);
            } else if from == WorkerState::InCriticalSection && inside == Some(worker) {
                inside = None;
            }
        }
        Ok(())
    }

    /// Largest number of workers simultaneously holding admission.
    ///
    /// A worker holds admission from entering an admission-holding state
    /// until it leaves one or its slot is vacated.
    pub fn max_admission_holders(&self) -> usize {
        let mut holding = HashSet::new();
        let mut max = 0;
        for entry in &self.entries {
            match entry.event {
                TraceEvent::Transition { worker, to, .. } if to.holds_admission() => {
                    holding.insert(worker);
                }
                TraceEvent::Transition { worker, .. } => {
                    holding.remove(&worker);
                }
                TraceEvent::SlotVacated { by, .. } => {
                    holding.remove(&by);
                }
                TraceEvent::SlotFilled { .. } => {}
            }
            max = max.max(holding.len());
        }
        max
    }

    /// Every slot removal is done by the worker that filled it, and the slot
    /// is never filled twice.
    pub fn check_self_release(&self) -> Result<(), TraceViolation> {
        let mut resident: Option<WorkerId> = None;
        for entry in &self.entries {
            match entry.event {
                TraceEvent::SlotFilled { worker } => {
                    if let Some(resident) = resident {
                        return Err(TraceViolation::DoubleAdmission {
                            seq: entry.seq,
                            resident,
                            worker,
                        });
                    }
                    resident = Some(worker);
                }
                TraceEvent::SlotVacated { by, resident: removed } => {
                    if resident != Some(by) || removed != by {
                        return Err(TraceViolation::ForeignRelease {
                            seq: entry.seq,
                            by,
                            filled_by: resident,
                        });
                    }
                    resident = None;
                }
                TraceEvent::Transition { .. } => {}
            }
        }
        Ok(())
    }

    /// Run every safety check.
    pub fn verify(&self) -> Result<(), TraceViolation> {
        self.check_mutual_exclusion()?;
        self.check_self_release()
    }
}
