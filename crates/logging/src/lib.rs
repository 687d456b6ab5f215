//! Logging setup for Diffusion Orchestrator
//!
//! This crate installs the global `tracing` subscriber: an `EnvFilter` driven by
//! `RUST_LOG` or by the configured level adjusted with `-v`/`-q` counters, a
//! human readable or JSON stdout layer, and an optional daily rolling file.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use common::error::{Error, Result};
use settings::LoggingSettings;

/// Verbosity adjustments requested on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    /// Number of `-v` flags
    pub verbose: u8,
    /// Number of `-q` flags
    pub quiet: u8,
}

impl Verbosity {
    /// Applies the counters to a base level, one step per flag
    pub fn apply(&self, base: LevelFilter) -> LevelFilter {
        const LEVELS: [LevelFilter; 6] = [
            LevelFilter::OFF,
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::DEBUG,
            LevelFilter::TRACE,
        ];

        let position = LEVELS.iter().position(|level| *level == base).unwrap_or(1) as i32;
        let adjusted = (position + self.verbose as i32 - self.quiet as i32)
            .clamp(0, LEVELS.len() as i32 - 1);

        LEVELS[adjusted as usize]
    }
}

/// Keeps the background file writer alive; flushes on drop
#[must_use = "dropping the guard stops the file writer"]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Parses a level name such as `info` or `off`
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| Error::Config(format!("Unknown log level: {}", level)))
}

/// Installs the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init(settings: &LoggingSettings, verbosity: Verbosity) -> Result<LogGuard> {
    let level = verbosity.apply(parse_level(&settings.level)?);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let stdout_layer = if settings.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, file_guard) = match &settings.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                Error::Config(format!("Invalid log file path: {}", path.display()))
            })?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            (
                Some(fmt::layer().with_ansi(false).with_writer(writer).boxed()),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install log subscriber: {}", e)))?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_steps() {
        let base = LevelFilter::ERROR;

        assert_eq!(Verbosity::default().apply(base), LevelFilter::ERROR);
        assert_eq!(Verbosity { verbose: 1, quiet: 0 }.apply(base), LevelFilter::WARN);
        assert_eq!(Verbosity { verbose: 2, quiet: 0 }.apply(base), LevelFilter::INFO);
        assert_eq!(Verbosity { verbose: 9, quiet: 0 }.apply(base), LevelFilter::TRACE);
        assert_eq!(Verbosity { verbose: 0, quiet: 1 }.apply(base), LevelFilter::OFF);
        assert_eq!(Verbosity { verbose: 2, quiet: 1 }.apply(base), LevelFilter::WARN);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level("OFF").unwrap(), LevelFilter::OFF);
        assert!(parse_level("loud").is_err());
    }
}
