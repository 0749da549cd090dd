//! relaycraft-logging
//!
//! A single `tracing-subscriber` init point shared by every relaycraft
//! binary, so the CLI and tests configure logging identically.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Coarse log level, independent of `tracing`'s `Level` so callers don't
/// need the `tracing` crate in scope just to pick a verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info,relaycraft=debug",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Initialize the global `tracing` subscriber at the given level, honoring
/// `RUST_LOG` if it is set. Safe to call more than once; only the first
/// call takes effect.
///
/// Returns an error if a subscriber has already been installed by someone
/// else (e.g. a test harness), so callers that merely want "best effort"
/// initialization should ignore the result.
pub fn try_init(level: LogLevel) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
}

/// Initialize the global `tracing` subscriber exactly once per process,
/// silently ignoring the case where one is already installed. Intended for
/// test setup, where many tests may call this concurrently.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = try_init(LogLevel::Debug);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_strings_are_non_empty() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert!(!level.directive().is_empty());
        }
    }

    #[test]
    fn init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
    }
}
