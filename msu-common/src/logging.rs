//! Process-wide tracing setup.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Environment variable holding the log filter directive.
pub const LOG_ENV_VAR: &str = "MSU_PREFLIGHT_LOG";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("cannot open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub stderr: bool,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Level from `MSU_PREFLIGHT_LOG`, falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var(LOG_ENV_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        Self {
            level,
            stderr: false,
            json: false,
            file: None,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Also append plain-text logs to `path`.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        EnvFilter::try_new(&self.level).map_err(|source| LoggingError::Filter {
            directive: self.level.clone(),
            source,
        })
    }
}

/// Flush guards for non-blocking writers; hold until exit.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn console_layer(config: &LogConfig) -> BoxedLayer {
    match (config.json, config.stderr) {
        (true, true) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (true, false) => fmt::layer().json().boxed(),
        (false, true) => fmt::layer().with_writer(std::io::stderr).boxed(),
        (false, false) => fmt::layer().boxed(),
    }
}

fn file_appender(path: &Path) -> Result<RollingFileAppender, LoggingError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "msu-preflight.log".to_string());

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .map_err(|source| LoggingError::File {
            path: path.to_path_buf(),
            source,
        })
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = config.filter()?;
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    if let Some(path) = &config.file {
        let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
        guards.push(guard);
        layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = LogConfig::from_env("info")
            .with_stderr()
            .with_level("debug")
            .with_json()
            .with_file("/tmp/msu-preflight.log");
        assert_eq!(config.level, "debug");
        assert!(config.stderr);
        assert!(config.json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/msu-preflight.log")));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig::from_env("info").with_level("msu_common=notalevel");
        assert!(matches!(config.filter(), Err(LoggingError::Filter { .. })));
    }

    #[test]
    fn test_valid_filter_accepted() {
        let config = LogConfig::from_env("info").with_level("msu_common=debug,warn");
        assert!(config.filter().is_ok());
    }
}
