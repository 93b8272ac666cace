//! Worker identity and the per-worker state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of one worker.
///
/// Used for log lines and admission order only; no correctness decision
/// depends on its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for WorkerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle of a worker's single pass through the critical section.
///
/// ```text
/// Idle -> RequestingAdmission -> Admitted -> EnteringGate -> InCriticalSection
///      -> ExitingGate -> ReleasingAdmission -> Done
///
/// RequestingAdmission -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    RequestingAdmission,
    Admitted,
    EnteringGate,
    InCriticalSection,
    ExitingGate,
    ReleasingAdmission,
    Done,
    Cancelled,
}

impl WorkerState {
    /// The only state reachable from `self`, besides cancellation.
    fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::RequestingAdmission),
            Self::RequestingAdmission => Some(Self::Admitted),
            Self::Admitted => Some(Self::EnteringGate),
            Self::EnteringGate => Some(Self::InCriticalSection),
            Self::InCriticalSection => Some(Self::ExitingGate),
            Self::ExitingGate => Some(Self::ReleasingAdmission),
            Self::ReleasingAdmission => Some(Self::Done),
            Self::Done | Self::Cancelled => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.successor() == Some(next)
            || (self == Self::RequestingAdmission && next == Self::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// States in which the worker owns the admission slot.
    pub fn holds_admission(self) -> bool {
        matches!(
            self,
            Self::Admitted
                | Self::EnteringGate
                | Self::InCriticalSection
                | Self::ExitingGate
                | Self::ReleasingAdmission
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingAdmission => "requesting_admission",
            Self::Admitted => "admitted",
            Self::EnteringGate => "entering_gate",
            Self::InCriticalSection => "in_critical_section",
            Self::ExitingGate => "exiting_gate",
            Self::ReleasingAdmission => "releasing_admission",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
