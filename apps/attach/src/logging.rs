//! Log setup for the `attach` binary.
//!
//! An attached session owns the terminal, so its logs go to a per-session
//! file under `~/.attach/logs` unless `--log-file` says otherwise. The other
//! subcommands log to stderr.

use clap::ValueEnum;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Full `EnvFilter` directive string, replacing the level-derived one.
pub const FILTER_ENV: &str = "ATTACH_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    File(PathBuf),
}

impl LogSink {
    /// `explicit` wins; otherwise a session logs to its own file and
    /// everything else to stderr.
    pub fn choose(explicit: Option<PathBuf>, session_id: Option<&str>) -> LogSink {
        if let Some(path) = explicit {
            return LogSink::File(path);
        }
        match (session_id, log_dir()) {
            (Some(session_id), Some(dir)) => LogSink::File(session_log_path(&dir, session_id)),
            _ => LogSink::Stderr,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LogInitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install logger: {0}")]
    Install(String),
}

fn log_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".attach").join("logs"))
}

/// Session ids come from the command line; keep them to one path segment.
pub fn session_log_path(dir: &Path, session_id: &str) -> PathBuf {
    let name: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let name = if name.is_empty() { "session".to_string() } else { name };
    dir.join(format!("{name}.log"))
}

/// Our own targets follow `level`; dependencies never go past `info`.
pub fn filter_directives(level: LogLevel) -> String {
    let ours = LevelFilter::from(level);
    let deps = ours.min(LevelFilter::INFO);
    format!("{deps},attach={ours},attach_client={ours}").to_lowercase()
}

/// Installs the global subscriber. Keep the guard alive until exit or
/// buffered lines are lost.
pub fn init(level: LogLevel, sink: &LogSink) -> Result<WorkerGuard, LogInitError> {
    let filter = match std::env::var(FILTER_ENV) {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(filter_directives(level)),
    };

    let (writer, guard) = match sink {
        LogSink::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| LogInitError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogInitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        LogSink::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(level >= LogLevel::Debug)
        .with_ansi(*sink == LogSink::Stderr)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| LogInitError::Install(err.to_string()))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn dependencies_stay_at_info_when_tracing() {
        assert_eq!(
            filter_directives(LogLevel::Trace),
            "info,attach=trace,attach_client=trace"
        );
        assert_eq!(
            filter_directives(LogLevel::Warn),
            "warn,attach=warn,attach_client=warn"
        );
    }

    #[test_timeout::timeout]
    fn session_logs_get_their_own_file() {
        let dir = Path::new("/var/log/attach");
        assert_eq!(
            session_log_path(dir, "build-42"),
            dir.join("build-42.log")
        );
        assert_eq!(
            session_log_path(dir, "../etc/passwd"),
            dir.join("___etc_passwd.log")
        );
        assert_eq!(session_log_path(dir, ""), dir.join("session.log"));

        let explicit = PathBuf::from("/tmp/attach.log");
        assert_eq!(
            LogSink::choose(Some(explicit.clone()), Some("s1")),
            LogSink::File(explicit)
        );
        assert_eq!(LogSink::choose(None, None), LogSink::Stderr);
    }
}
