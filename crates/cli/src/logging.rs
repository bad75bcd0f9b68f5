//! Logging setup for the command-line driver.
//!
//! Supports two modes:
//! - Development: Pretty-printed human-readable logs
//! - Aggregation: JSON-formatted logs
//!
//! Set `MOE_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info, or `--log-level`).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` is pretty.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }

    /// Detect log format from `MOE_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("MOE_LOG_FORMAT").unwrap_or_default())
    }
}

/// Initialize the logging subsystem with an explicit default level.
///
/// `RUST_LOG` still wins when it is set.
pub fn init_with_level(level: &str) {
    init_with_level_and_format(level, LogFormat::from_env());
}

/// Initialize the logging subsystem with an explicit level and format.
pub fn init_with_level_and_format(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A second init (tests, repeated runs in one process) is ignored.
    let _ = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_thread_names(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
}
