//! mutex-coordinator: centralized mutual exclusion with FIFO admission.
//!
//! A capacity-1 [`AdmissionQueue`] admits one worker at a time and an
//! [`ExclusionGate`] guards the critical section itself. Both are owned by a
//! [`Coordinator`] shared between workers; [`CriticalSection`] drives one
//! worker through the protocol and [`Driver`] runs N of them to completion.

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod driver;
mod error;
pub mod gate;
pub mod logging;
pub mod section;
pub mod trace;
mod worker;

pub use admission::{AdmissionQueue, AdmissionTicket};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{Coordinator, Occupancy, Residency};
pub use driver::{Driver, DriverError, RunHandle, RunReport};
pub use error::{CoordinatorError, fatal};
pub use gate::{ExclusionGate, GateGuard};
pub use section::{CriticalSection, CriticalWork, SimulatedWork, WorkError, WorkerReport};
pub use trace::{Trace, TraceEntry, TraceEvent, TraceViolation, TransitionLog};
pub use worker::{WorkerId, WorkerState};
