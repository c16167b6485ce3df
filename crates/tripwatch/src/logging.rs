//! Logging setup for tripwatch.
//!
//! Everything logs through `tracing`; this module installs the subscriber.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are chatty at debug level and stay at `warn`.
const QUIET_DEPENDENCIES: &[&str] = &["reqwest", "hyper", "hyper_util", "rustls"];

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Info and above.
    #[default]
    Normal,
    /// Debug and above.
    Verbose,
    /// Everything.
    Trace,
}

impl Verbosity {
    /// Map `-q` and the number of `-v` flags to a verbosity.
    #[must_use]
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// Tracing level for this verbosity.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Filter directives used when `RUST_LOG` is not set.
    #[must_use]
    pub fn default_directives(&self) -> String {
        let mut directives = format!("tripwatch={}", self.to_level_filter());
        for dep in QUIET_DEPENDENCIES {
            directives.push_str(&format!(",{dep}=warn"));
        }
        directives
    }
}

/// Install the global subscriber.
///
/// Call once at startup. `RUST_LOG` takes precedence over `verbosity`.
/// Later calls are no-ops.
///
/// ```no_run
/// use tripwatch::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directives()));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    );

    // Already installed is fine.
    let _ = subscriber.try_init();
}

/// Route logs through the test harness, warnings and up.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_to_level() {
        assert_eq!(Verbosity::Quiet.to_level_filter(), Level::ERROR);
        assert_eq!(Verbosity::Normal.to_level_filter(), Level::INFO);
        assert_eq!(Verbosity::Verbose.to_level_filter(), Level::DEBUG);
        assert_eq!(Verbosity::Trace.to_level_filter(), Level::TRACE);
    }

    #[test]
    fn test_verbosity_from_flags() {
        assert_eq!(Verbosity::from_flags(true, 2), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, 0), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, 1), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, 5), Verbosity::Trace);
    }

    #[test]
    fn test_default_directives() {
        let directives = Verbosity::Verbose.default_directives();
        assert!(directives.starts_with("tripwatch=DEBUG"));
        assert!(directives.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_test_logging();
        init_logging(Verbosity::Quiet);
        init_logging(Verbosity::Trace);
    }
}
