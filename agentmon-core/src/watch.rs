//! File-system change notification
//!
//! Wraps `notify` with a 500 ms debouncer and forwards changed paths into a
//! tokio channel. When the platform backend is unavailable, callers log a
//! warning and rely on their poll interval instead.

use crate::error::{Error, Result};
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Debounce window for change notifications
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// A debounced watcher delivering changed paths
pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
    watched: Vec<PathBuf>,
}

impl FileWatcher {
    /// Create a watcher and the receiving end of its change channel
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let debouncer = new_debouncer(DEBOUNCE, move |res: DebounceEventResult| match res {
            Ok(events) => {
                for event in events {
                    // Receiver gone means the adapter stopped
                    let _ = tx.send(event.path);
                }
            }
            Err(e) => tracing::debug!(error = %e, "File watch error"),
        })
        .map_err(|e| Error::Watch(e.to_string()))?;

        Ok((
            Self {
                debouncer,
                watched: Vec::new(),
            },
            rx,
        ))
    }

    /// Watch a file or directory. Missing paths are skipped.
    pub fn watch(&mut self, path: &Path, recursive: bool) -> Result<bool> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Not watching missing path");
            return Ok(false);
        }
        if self.watched.iter().any(|p| p == path) {
            return Ok(true);
        }

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.debouncer
            .watcher()
            .watch(path, mode)
            .map_err(|e| Error::Watch(format!("{}: {}", path.display(), e)))?;
        self.watched.push(path.to_path_buf());
        Ok(true)
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

/// Create a watcher over `targets`, or `None` if the backend is unavailable
pub fn watch_paths(
    agent: &str,
    targets: &[(PathBuf, bool)],
) -> Option<(FileWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (mut watcher, rx) = match FileWatcher::new() {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(agent, error = %e, "File watching unavailable, polling only");
            return None;
        }
    };
    for (path, recursive) in targets {
        if let Err(e) = watcher.watch(path, *recursive) {
            tracing::warn!(agent, path = %path.display(), error = %e, "Failed to watch path");
        }
    }
    Some((watcher, rx))
}

/// Wait for the next change, or forever when there is no watcher
pub async fn next_change(rx: &mut Option<mpsc::UnboundedReceiver<PathBuf>>) -> Option<PathBuf> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
