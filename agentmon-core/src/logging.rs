//! Tracing setup for the agentmon binaries
//!
//! Everything goes to daily-rotated files under `$XDG_STATE_HOME/agentmon/`.
//! A foreground daemon also mirrors its log to stderr. Hook invocations run
//! inside the agent's own process, so they never touch the terminal: they get
//! their own file at `warn`, or no subscriber at all if that file can't be
//! opened.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Where a process sends its log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Detached daemon: file only
    Daemon,
    /// `daemon --foreground`: file plus stderr
    Foreground,
    /// Short-lived `hook` process: its own file, warnings only
    Hook,
}

impl LogTarget {
    /// File name prefix for the rotated log
    pub fn file_prefix(self) -> &'static str {
        match self {
            LogTarget::Daemon | LogTarget::Foreground => "agentmon.log",
            LogTarget::Hook => "hook.log",
        }
    }

    /// Filter directives for this target. `RUST_LOG` overrides the daemon's
    /// level but never a hook's, since hooks inherit the agent's environment.
    pub fn directives(self, config: &LoggingConfig) -> String {
        match self {
            LogTarget::Hook => "warn".to_string(),
            LogTarget::Daemon | LogTarget::Foreground => std::env::var("RUST_LOG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| config.level.clone()),
        }
    }
}

/// Build the filter for a directive string, falling back to `info` when the
/// string does not parse
pub fn build_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber for `target`, logging into `Config::state_dir()`
pub fn init(config: &LoggingConfig, target: LogTarget) -> Result<LoggingGuard> {
    init_in(&Config::state_dir(), config, target)
}

/// Install the global subscriber with an explicit log directory
pub fn init_in(log_dir: &Path, config: &LoggingConfig, target: LogTarget) -> Result<LoggingGuard> {
    let directives = target.directives(config);
    let (file_layer, guard) = match file_layer(log_dir, config, target) {
        Ok(parts) => parts,
        Err(_) if target == LogTarget::Hook => return Ok(LoggingGuard { _guard: None }),
        Err(e) => return Err(e),
    };

    let stderr_layer = (target == LogTarget::Foreground).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(build_filter(&directives))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::debug!(
        log_dir = %log_dir.display(),
        filter = %directives,
        target = ?target,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn file_layer(
    log_dir: &Path,
    config: &LoggingConfig,
    target: LogTarget,
) -> Result<(BoxedLayer, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(target.file_prefix())
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(target != LogTarget::Hook)
        .with_file(true)
        .with_line_number(true)
        .boxed();
    Ok((layer, guard))
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer alive; pending lines are flushed on drop
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

/// Path of the daemon's current log (before the date suffix)
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}
