//! # Observability
//!
//! Logging setup shared by every Murmur binary.
//!
//! Crates only ever use `tracing` macros. The binary calls [`init`] or
//! [`init_with_config`] once at startup and decides where the lines go.
//!
//! ## Dev sink
//!
//! With the `dev` feature (on by default) every event is appended as one JSON
//! object per line to `~/.murmur/logs/dev.jsonl`:
//!
//! ```text
//! tail -f ~/.murmur/logs/dev.jsonl | jq 'select(.fields.room_id == "...")'
//! ```
//!
//! Fields recorded on enclosing spans (for example the `room_id` of a room
//! session span) are copied onto each line, so a single room can be followed
//! without knowing which task emitted the event.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "murmur-cli".into(),
//!         default_level: "debug".into(),
//!         also_stderr: true,
//!         ..Default::default()
//!     });
//!     tracing::info!("ready");
//! }
//! ```

#[cfg(feature = "dev")]
mod dev;

mod json_layer;

use std::path::PathBuf;

pub use json_layer::{JsonLayer, LogEntry};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the emitting service, written on every line.
    pub service_name: String,

    /// Default filter directive (e.g. "info", "room_reconciler=debug").
    /// `RUST_LOG` wins when set.
    pub default_level: String,

    /// Custom JSONL path. Defaults to `~/.murmur/logs/dev.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Echo a compact human-readable stream on stderr as well.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging with defaults for the given service.
///
/// # Panics
///
/// Panics if the log file cannot be created, or if a global subscriber was
/// already installed.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with a custom configuration.
pub fn init_with_config(config: LogConfig) {
    #[cfg(feature = "dev")]
    {
        dev::init_dev_subscriber(&config);
    }

    #[cfg(not(feature = "dev"))]
    {
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.default_level)),
            )
            .with_target(true)
            .compact()
            .finish()
            .init();
    }
}

pub use tracing::{debug, error, info, instrument, trace, warn};
pub use tracing::Level;
