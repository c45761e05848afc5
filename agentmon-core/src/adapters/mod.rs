//! Source adapters
//!
//! Each adapter watches one external tool and turns what it finds into
//! candidate sessions and event deltas. Detection differs per tool; merging
//! is shared through [`reconcile::Reconciler`].
//!
//! | Adapter | Agent type | Techniques |
//! |---------|------------|------------|
//! | [`claude`] | `claude_code` | process scan, `history.jsonl`, transcripts, stats snapshot, hooks |
//! | [`aider`] | `aider` | process scan, `.aider.chat.history.md` |
//! | [`cursor`] | `cursor` | process scan, `ide_state.json`, `main.log` |
//! | [`manifest`] | `custom` | whatever the loaded descriptor declares |
//!
//! ## Lifecycle
//!
//! `start()` warms the cache from the store, records current file ends so
//! history is not replayed, runs one discovery and spawns the background
//! loop. The loop ticks at the adapter's poll interval (ended-process
//! detection plus incremental file reads) and reacts to file notifications
//! in between. `stop()` signals the loop and waits for it to exit.

pub mod aider;
pub mod claude;
pub mod cursor;
pub mod hooks;
pub mod manifest;
pub mod reconcile;

pub use aider::AiderState;
pub use claude::ClaudeState;
pub use cursor::CursorState;
pub use hooks::{install_hooks, HookKind, HookPayload};
pub use manifest::{load_manifests, AdapterManifest, ManifestState};
pub use reconcile::{AdapterContext, Reconciler, SessionCache};

use crate::config::Config;
use crate::error::Result;
use crate::process::{snapshot_blocking, ProcessInfo, ProcessSource};
use crate::types::{AdapterCapabilities, AgentType, Session};
use crate::watch::{next_change, watch_paths};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use reconcile::Lifecycle;

/// Tool-specific detection state driven by a [`SourceAdapter`]
pub trait SourceState: Send + 'static {
    fn reconciler(&mut self) -> &mut Reconciler;

    /// Build candidates from every technique and reconcile them
    fn discover_with(&mut self, processes: &[ProcessInfo]) -> Result<Vec<Session>>;

    /// Record the current end of every tailed file
    fn prime(&mut self) {}

    /// Paths to watch, with a recursive flag
    fn watch_targets(&self) -> Vec<(PathBuf, bool)> {
        Vec::new()
    }

    /// Read newly appended content from every tailed file
    fn poll(&mut self) {}

    /// React to a changed path reported by the watcher
    fn on_change(&mut self, _path: &Path) {
        self.poll();
    }

    /// Periodic work: close sessions whose process exited, then read files
    fn tick(&mut self, processes: &[ProcessInfo]) {
        let live: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        let agent = self.reconciler().agent_type();
        if let Err(e) = self.reconciler().detect_ended(&live) {
            tracing::warn!(agent = %agent, error = %e, "Ended-process detection failed");
        }
        self.poll();
    }
}

/// Runs a [`SourceState`] under a mutex with a cancellable background loop
pub struct SourceAdapter<S: SourceState> {
    name: String,
    capabilities: AdapterCapabilities,
    poll_interval: Duration,
    processes: Arc<dyn ProcessSource>,
    state: Arc<Mutex<S>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<S: SourceState> SourceAdapter<S> {
    pub fn new(
        name: impl Into<String>,
        capabilities: AdapterCapabilities,
        poll_interval: Duration,
        processes: Arc<dyn ProcessSource>,
        state: S,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities,
            poll_interval: poll_interval.max(Duration::from_millis(100)),
            processes,
            state: Arc::new(Mutex::new(state)),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub async fn discover(&self) -> Result<Vec<Session>> {
        let processes = snapshot_blocking(Arc::clone(&self.processes)).await;
        self.state.lock().await.discover_with(&processes)
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_running() {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            match state.reconciler().warm_cache() {
                Ok(n) => tracing::debug!(adapter = %self.name, sessions = n, "Cache warmed"),
                Err(e) => tracing::warn!(adapter = %self.name, error = %e, "Failed to warm cache"),
            }
            state.prime();
        }

        match self.discover().await {
            Ok(sessions) => {
                tracing::info!(adapter = %self.name, sessions = sessions.len(), "Adapter started")
            }
            Err(e) => tracing::warn!(adapter = %self.name, error = %e, "Initial discovery failed"),
        }

        let targets = self.state.lock().await.watch_targets();
        let shutdown = lifecycle.begin();
        lifecycle.track(spawn_loop(
            self.name.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.processes),
            self.poll_interval,
            targets,
            shutdown,
        ));
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.lock().await.stop().await;
        tracing::info!(adapter = %self.name, "Adapter stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_running()
    }

    pub async fn reload_cache(&self) -> Result<usize> {
        self.state.lock().await.reconciler().reload_cache()
    }

    /// Run `f` with exclusive access to the adapter state
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }
}

fn spawn_loop<S: SourceState>(
    name: String,
    state: Arc<Mutex<S>>,
    processes: Arc<dyn ProcessSource>,
    poll_interval: Duration,
    targets: Vec<(PathBuf, bool)>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // The watcher lives as long as the loop
        let (_watcher, mut changes) = match watch_paths(&name, &targets) {
            Some((watcher, rx)) => (Some(watcher), Some(rx)),
            None => (None, None),
        };

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let snapshot = snapshot_blocking(Arc::clone(&processes)).await;
                    state.lock().await.tick(&snapshot);
                }
                Some(path) = next_change(&mut changes) => {
                    tracing::trace!(adapter = %name, path = %path.display(), "File changed");
                    state.lock().await.on_change(&path);
                }
            }
        }
        tracing::debug!(adapter = %name, "Adapter loop exited");
    })
}

// ============================================
// Adapter set
// ============================================

/// Every supported adapter. Manifest-described tools share one variant.
pub enum Adapter {
    ClaudeCode(SourceAdapter<ClaudeState>),
    Aider(SourceAdapter<AiderState>),
    Cursor(SourceAdapter<CursorState>),
    Manifest(SourceAdapter<ManifestState>),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Adapter::ClaudeCode($inner) => $body,
            Adapter::Aider($inner) => $body,
            Adapter::Cursor($inner) => $body,
            Adapter::Manifest($inner) => $body,
        }
    };
}

impl Adapter {
    pub fn claude_code(config: &Config, ctx: AdapterContext) -> Self {
        let processes = Arc::clone(&ctx.processes);
        Adapter::ClaudeCode(SourceAdapter::new(
            AgentType::ClaudeCode.as_str(),
            claude::capabilities(),
            Duration::from_secs(config.daemon.poll_interval_secs),
            processes,
            ClaudeState::new(config.claude_code.clone(), ctx),
        ))
    }

    pub fn aider(config: &Config, ctx: AdapterContext) -> Self {
        let processes = Arc::clone(&ctx.processes);
        Adapter::Aider(SourceAdapter::new(
            AgentType::Aider.as_str(),
            aider::capabilities(),
            Duration::from_secs(config.daemon.poll_interval_secs),
            processes,
            AiderState::new(config.aider.clone(), ctx),
        ))
    }

    pub fn cursor(config: &Config, ctx: AdapterContext) -> Self {
        let processes = Arc::clone(&ctx.processes);
        Adapter::Cursor(SourceAdapter::new(
            AgentType::Cursor.as_str(),
            cursor::capabilities(),
            Duration::from_secs(config.daemon.poll_interval_secs),
            processes,
            CursorState::new(config.cursor.clone(), ctx),
        ))
    }

    pub fn manifest(manifest: AdapterManifest, ctx: AdapterContext) -> Result<Self> {
        let processes = Arc::clone(&ctx.processes);
        let name = manifest.name.clone();
        let capabilities = manifest.capabilities;
        let poll = Duration::from_secs(manifest.poll_interval.max(1));
        let state = ManifestState::new(manifest, ctx)?;
        Ok(Adapter::Manifest(SourceAdapter::new(
            name,
            capabilities,
            poll,
            processes,
            state,
        )))
    }

    /// Build the enabled built-in adapters plus one per manifest found in
    /// `manifests_dir`. Manifests that fail to load are logged and skipped.
    pub fn from_config(config: &Config, ctx: &AdapterContext, manifests_dir: &Path) -> Vec<Adapter> {
        let mut adapters = Vec::new();
        for agent in &config.daemon.enabled_adapters {
            match agent {
                AgentType::ClaudeCode => adapters.push(Adapter::claude_code(config, ctx.clone())),
                AgentType::Aider => adapters.push(Adapter::aider(config, ctx.clone())),
                AgentType::Cursor => adapters.push(Adapter::cursor(config, ctx.clone())),
                AgentType::Custom => {}
            }
        }

        for manifest in load_manifests(manifests_dir) {
            let name = manifest.name.clone();
            match Adapter::manifest(manifest, ctx.clone()) {
                Ok(adapter) => adapters.push(adapter),
                Err(e) => tracing::warn!(manifest = %name, error = %e, "Skipping manifest adapter"),
            }
        }
        adapters
    }

    pub fn name(&self) -> &str {
        dispatch!(self, a => a.name())
    }

    pub fn agent_type(&self) -> AgentType {
        match self {
            Adapter::ClaudeCode(_) => AgentType::ClaudeCode,
            Adapter::Aider(_) => AgentType::Aider,
            Adapter::Cursor(_) => AgentType::Cursor,
            Adapter::Manifest(_) => AgentType::Custom,
        }
    }

    pub fn capabilities(&self) -> AdapterCapabilities {
        dispatch!(self, a => a.capabilities())
    }

    pub async fn discover(&self) -> Result<Vec<Session>> {
        dispatch!(self, a => a.discover().await)
    }

    pub async fn start(&self) -> Result<()> {
        dispatch!(self, a => a.start().await)
    }

    pub async fn stop(&self) {
        dispatch!(self, a => a.stop().await)
    }

    pub async fn is_running(&self) -> bool {
        dispatch!(self, a => a.is_running().await)
    }

    pub async fn reload_cache(&self) -> Result<usize> {
        dispatch!(self, a => a.reload_cache().await)
    }

    /// Route a hook notification to the Claude Code adapter. Returns the
    /// session id the hook was reconciled to.
    pub async fn handle_hook(
        &self,
        kind: HookKind,
        payload: HookPayload,
        at: Option<DateTime<Utc>>,
    ) -> Option<Result<String>> {
        match self {
            Adapter::ClaudeCode(a) => {
                Some(a.with_state(|state| state.handle_hook(kind, payload, at)).await)
            }
            _ => None,
        }
    }
}
