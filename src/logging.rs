//! Logging setup
//!
//! Console output always goes to stderr so command output on stdout stays
//! machine readable. `--debug` adds a daily-rolling file under the log
//! directory; `logging.file` writes to a fixed file instead.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name prefix of rolling debug logs.
const LOG_FILE_PREFIX: &str = "wa-gateway-sync.log";

#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    debug_mode: bool,
    log_dir: PathBuf,
    log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            debug_mode: false,
            log_dir: default_log_dir(),
            log_file: None,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = dir;
        self
    }

    pub fn with_log_file(mut self, file: Option<PathBuf>) -> Self {
        self.log_file = file;
        self
    }

    fn filter_directive(&self) -> String {
        let level = if self.debug_mode { "debug" } else { &self.level };
        // sqlx logs every statement at info
        format!("{},sqlx=warn,hyper=warn", level)
    }
}

/// `./logs` unless `DEBUG_LOGS_LOCATION` says otherwise.
pub fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>> {
    // RUST_LOG wins over configuration
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))
        .context("Invalid log filter")?;

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let appender = match (&config.log_file, config.debug_mode) {
        (Some(file), _) => {
            let dir = file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = file
                .file_name()
                .context("logging.file has no file name")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
            Some(tracing_appender::rolling::never(dir, name))
        }
        (None, true) => {
            std::fs::create_dir_all(&config.log_dir).with_context(|| {
                format!("Failed to create log directory: {:?}", config.log_dir)
            })?;
            Some(tracing_appender::rolling::daily(
                &config.log_dir,
                LOG_FILE_PREFIX,
            ))
        }
        (None, false) => None,
    };

    match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}

/// Remove rolling log files older than `days` from the default log directory.
pub fn cleanup_old_logs(days: u64) -> Result<usize> {
    let dir = std::env::var("DEBUG_LOGS_LOCATION")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_log_dir());
    cleanup_logs_in(&dir, Duration::from_secs(days * 24 * 60 * 60))
}

fn cleanup_logs_in(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))? {
        let entry = entry?;
        let is_log = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        let config = LogConfig::new().with_level("warn");
        assert_eq!(config.filter_directive(), "warn,sqlx=warn,hyper=warn");
        let debug = config.with_debug_mode(true);
        assert!(debug.filter_directive().starts_with("debug,"));
    }

    #[test]
    fn test_cleanup_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{}.2026-10-01", LOG_FILE_PREFIX));
        let other = dir.path().join("notes.txt");
        std::fs::write(&log, "line").unwrap();
        std::fs::write(&other, "keep").unwrap();

        let removed = cleanup_logs_in(dir.path(), Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(removed, 0);
        assert!(log.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(cleanup_logs_in(&missing, Duration::ZERO).unwrap(), 0);
    }
}
