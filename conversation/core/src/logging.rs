//! Tracing Setup
//!
//! Installs a `tracing-subscriber` fmt subscriber for binaries embedding the
//! conversation core. Libraries only emit through `tracing` macros and never
//! call this themselves.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Default filter directive
pub const DEFAULT_FILTER: &str = "conversation_core=info";

/// Logging settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,
    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Filter to install: `RUST_LOG` if set and valid, else the configured one
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&self.filter).unwrap_or_else(|e| {
                eprintln!("Invalid log filter {:?}: {e}; using {DEFAULT_FILTER}", self.filter);
                EnvFilter::new(DEFAULT_FILTER)
            })
        })
    }
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed; calling this more
/// than once is harmless.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(config.with_target)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}
