//! Tracing setup with MUTEX_LOG and LOG_FORMAT support.
//!
//! `RUST_LOG` takes precedence. Otherwise `MUTEX_LOG` picks the level for
//! this crate (debug|info|warn|error, default info). `LOG_FORMAT=json`
//! switches to structured JSON lines. Output always goes to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "MUTEX_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Filter directive for a `MUTEX_LOG` value.
pub fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("mutex_coordinator={level}")
}

/// Whether a `LOG_FORMAT` value selects JSON lines.
pub fn json_format(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

pub fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(filter_directive(std::env::var(LOG_ENV).ok().as_deref())),
    };

    // Exactly one of the two layers is present.
    let (json, plain) = if json_format(std::env::var(LOG_FORMAT_ENV).ok().as_deref()) {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init();
}
