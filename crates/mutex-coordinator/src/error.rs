//! Error types for the coordinator core.

use crate::worker::WorkerId;

/// Errors surfaced by the admission queue, the exclusion gate and the
/// critical-section wrapper.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The worker's wait for admission was cooperatively interrupted.
    ///
    /// Recovered locally by the worker; no shared state was touched.
    #[error("worker {worker} cancelled while waiting for admission")]
    Cancelled { worker: WorkerId },

    /// The mutual-exclusion guarantee has already failed.
    ///
    /// Never recovered. Callers hand it to [`fatal`].
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CoordinatorError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Log an unrecoverable coordinator error and abort the process.
///
/// Continuing after an invariant violation would hide a broken critical
/// section, so there is no unwinding here.
pub fn fatal(error: CoordinatorError) -> ! {
    tracing::error!(error = %error, "Coordinator invariant violated - aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_display_names_worker() {
        let err = CoordinatorError::Cancelled {
            worker: WorkerId::new(2),
        };
        assert_eq!(
            err.to_string(),
            "worker 2 cancelled while waiting for admission"
        );
        assert!(err.is_cancelled());
    }

    #[test]
    fn invariant_is_not_cancellation() {
        let err = CoordinatorError::invariant("gate entered while held");
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "invariant violation: gate entered while held");
    }
}
