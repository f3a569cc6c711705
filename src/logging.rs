//! Logging initialization shared by the binary and pipeline workers.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Serializable description of how to initialize logging.
///
/// The scheduler applies it once in every worker before that worker runs a
/// stage, so a worker never depends on state set up by whoever spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingInit {
    /// Default filter directive (e.g. `info`, `codex_pipeline=debug`).
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit ANSI colors
    #[serde(default = "default_true")]
    pub ansi: bool,

    /// Include the event target in each line
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingInit {
    fn default() -> Self {
        Self {
            level: default_level(),
            ansi: true,
            with_target: false,
        }
    }
}

impl LoggingInit {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install the global subscriber.
    ///
    /// Returns `false` when a subscriber was already installed, which is the
    /// normal case for every worker after the first.
    pub fn apply(&self) -> bool {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(self.ansi)
                    .with_target(self.with_target),
            )
            .with(self.filter())
            .try_init()
            .is_ok()
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent() {
        let init = LoggingInit::with_level("warn");
        // Whichever call installs first, later calls are no-ops.
        init.apply();
        assert!(!init.apply());
    }

    #[test]
    fn test_serde_defaults() {
        let init: LoggingInit = serde_json::from_str("{}").unwrap();
        assert_eq!(init, LoggingInit::default());
        assert_eq!(init.level, "info");
    }
}
