//! Unix socket server for the daemon's IPC protocol
//!
//! One task per connection. Each connection has a writer task fed by an
//! unbounded channel, so responses and subscription pushes never interleave
//! mid-line. A connection holds at most one subscription.

use agentmon_core::ipc::encode_line;
use agentmon_core::{Daemon, Request, Response, SubscriptionId};
use anyhow::{Context, Result};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Largest request line accepted before the connection is dropped
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, replacing a stale socket file left by a crashed daemon
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
        }

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                anyhow::bail!("socket {} is already being served", path.display());
            }
            tracing::info!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket: {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind socket: {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict socket permissions: {}", path.display()))?;

        tracing::info!(path = %path.display(), "IPC server listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` flips, then close them all and
    /// remove the socket file
    pub async fn run(self, daemon: Arc<Daemon>, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handle_connection(Arc::clone(&daemon), stream));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Socket already removed");
        }
        tracing::info!("IPC server stopped");
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read);
    let mut subscription: Option<SubscriptionId> = None;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(n) if n > MAX_LINE_BYTES => {
                tracing::warn!(bytes = n, "Dropping connection with oversized request");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Connection read failed");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match Request::parse(trimmed) {
            Ok(Request::Subscribe { filters }) => {
                if let Some(old) = subscription.take() {
                    daemon.unsubscribe(old);
                }
                subscription = Some(daemon.subscribe(filters, tx.clone()));
                Response::ok(json!({ "status": "subscribed" }))
            }
            Ok(Request::Unsubscribe) => {
                let removed = subscription.take().map(|id| daemon.unsubscribe(id)).unwrap_or(false);
                Response::ok(json!({ "status": "unsubscribed", "removed": removed }))
            }
            Ok(request) => daemon.handle_request(request).await,
            Err(e) => Response::from(e),
        };

        match encode_line(&response) {
            Ok(encoded) => {
                if tx.send(encoded).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode response"),
        }
    }

    if let Some(id) = subscription {
        daemon.unsubscribe(id);
    }
    drop(tx);
    let _ = writer.await;
}
