//! Tracing subscriber setup for the CLI.

use std::path::PathBuf;
use std::str::FromStr;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var holding an `EnvFilter` directive (e.g. `cadence=debug`).
pub const LOG_ENV: &str = "CADENCE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format '{}'. Valid values: text, json", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    pub verbose: bool,
    pub format: LogFormat,
    /// Also write JSON lines to `<dir>/cadence.log.<date>`.
    pub log_dir: Option<PathBuf>,
}

impl TelemetryOptions {
    fn filter(&self) -> EnvFilter {
        let fallback = if self.verbose { "debug" } else { "info" };
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
    }
}

/// Install the global subscriber. Console output goes to stderr.
///
/// The returned guard must be held for the life of the process when a log
/// directory is configured, or buffered file output is lost.
pub fn init_tracing(options: &TelemetryOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let console = match options.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "cadence.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(options.filter())
        .with(console)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_with_log_dir_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let options = TelemetryOptions {
            verbose: true,
            format: LogFormat::Json,
            log_dir: Some(dir.path().join("logs")),
        };
        let guard = init_tracing(&options).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}
