//! Run configuration, read from the environment.
//!
//! - `MUTEX_WORKERS`: number of workers (positive, default 3)
//! - `MUTEX_FIRST_ID`: identifier of the first worker (default 1)
//! - `MUTEX_HOLD_MS`: time each worker spends in the critical section (default 1000)

use std::time::Duration;

use crate::worker::WorkerId;

pub const WORKERS_ENV: &str = "MUTEX_WORKERS";
pub const FIRST_ID_ENV: &str = "MUTEX_FIRST_ID";
pub const HOLD_MS_ENV: &str = "MUTEX_HOLD_MS";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be an integer, got {value:?}")]
    NotAnInteger { var: &'static str, value: String },
    #[error("MUTEX_WORKERS must be at least 1")]
    NoWorkers,
    #[error("worker identifiers starting at {first} overflow for {workers} workers")]
    IdOverflow { first: u64, workers: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub workers: usize,
    pub first_id: u64,
    pub hold: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            first_id: 1,
            hold: Duration::from_millis(1000),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workers = parse(&lookup, WORKERS_ENV)?.map_or(Ok(defaults.workers), |n| {
            usize::try_from(n).map_err(|_| ConfigError::NotAnInteger {
                var: WORKERS_ENV,
                value: n.to_string(),
            })
        })?;
        let first_id = parse(&lookup, FIRST_ID_ENV)?.unwrap_or(defaults.first_id);
        let hold = parse(&lookup, HOLD_MS_ENV)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.hold);

        let config = Self {
            workers,
            first_id,
            hold,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_first_id(mut self, first_id: u64) -> Self {
        self.first_id = first_id;
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let overflow = ConfigError::IdOverflow {
            first: self.first_id,
            workers: self.workers,
        };
        let last_offset = u64::try_from(self.workers - 1).map_err(|_| overflow.clone())?;
        self.first_id.checked_add(last_offset).ok_or(overflow)?;
        Ok(())
    }

    /// Distinct, stable identifiers for this run.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.workers as u64)
            .map(|offset| WorkerId::new(self.first_id + offset))
            .collect()
    }
}

fn parse(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::NotAnInteger { var, value: raw }),
    }
}
