//! Daemon orchestrator
//!
//! Owns the event bus, the adapters and two background loops:
//!
//! - **discovery**: every `discovery_interval_secs`, each adapter runs a full
//!   discovery pass
//! - **maintenance**: at start and every `maintenance_interval_secs`, a
//!   dedup sweep, stale sweep, cache reload and hourly metric rollup
//!
//! Requests from the IPC server are answered by [`Daemon::handle_request`].

use crate::adapters::reconcile::Lifecycle;
use crate::adapters::{install_hooks, Adapter, AdapterContext, HookPayload};
use crate::bus::{EventBus, EventFilter, SubscriptionId, WILDCARD};
use crate::config::{Config, DaemonConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::ipc::{
    encode_line, event_message, Request, Response, DEFAULT_EVENTS_MINUTES, DEFAULT_LIMIT,
    DEFAULT_METRICS_HOURS,
};
use crate::process::{ProcessSource, SystemProcesses};
use crate::types::{AgentType, DaemonState, DedupReport, EventType, SessionEvent};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;

/// Events recorded on a session detail response
const SESSION_DETAIL_EVENTS: usize = 100;

/// Counts every event that passes through the bus
#[derive(Debug, Default)]
pub struct StatusTracker {
    counts: Mutex<HashMap<EventType, u64>>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

impl StatusTracker {
    pub fn record(&self, event: &SessionEvent) {
        *self.counts.lock().unwrap().entry(event.event_type).or_insert(0) += 1;
        let mut last = self.last_event_at.lock().unwrap();
        if last.map(|t| event.timestamp > t).unwrap_or(true) {
            *last = Some(event.timestamp);
        }
    }

    /// Counts keyed by event type name
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counts
            .lock()
            .unwrap()
            .iter()
            .map(|(t, n)| (t.as_str().to_string(), *n))
            .collect()
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        *self.last_event_at.lock().unwrap()
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub dedup: DedupReport,
    pub cache_entries_dropped: usize,
    pub stale_sessions: usize,
    pub metrics_updated: usize,
}

pub struct Daemon {
    config: Config,
    db: Arc<Database>,
    bus: Arc<EventBus>,
    adapters: Arc<Vec<Adapter>>,
    tracker: Arc<StatusTracker>,
    state: RwLock<DaemonState>,
    started_at: DateTime<Utc>,
    lifecycle: AsyncMutex<Lifecycle>,
}

impl Daemon {
    /// Start with the real process table and the configured manifests dir
    pub async fn start(config: Config, db: Arc<Database>) -> Result<Self> {
        Self::start_with(config, db, Arc::new(SystemProcesses::new()), &Config::manifests_dir()).await
    }

    /// Start with an explicit process source and manifests directory
    pub async fn start_with(
        config: Config,
        db: Arc<Database>,
        processes: Arc<dyn ProcessSource>,
        manifests_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.daemon.event_queue_size));
        bus.start();

        let tracker = Arc::new(StatusTracker::default());
        {
            let tracker = Arc::clone(&tracker);
            bus.subscribe(WILDCARD, move |event| {
                tracker.record(&event);
                async { Ok(()) }
            });
        }

        let ctx = AdapterContext {
            db: Arc::clone(&db),
            bus: Arc::clone(&bus),
            pricing: Arc::new(config.pricing.table()),
            processes,
        };
        let adapters = Adapter::from_config(&config, &ctx, manifests_dir);

        if config.daemon.auto_install_hooks
            && adapters.iter().any(|a| a.agent_type() == AgentType::ClaudeCode)
        {
            match install_hooks(&config.claude_code.home_dir()) {
                Ok(true) => tracing::info!("Claude Code hooks installed"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to install Claude Code hooks"),
            }
        }

        for adapter in &adapters {
            if let Err(e) = adapter.start().await {
                tracing::warn!(adapter = adapter.name(), error = %e, "Adapter failed to start");
            }
        }

        let daemon = Self {
            config,
            db,
            bus,
            adapters: Arc::new(adapters),
            tracker,
            state: RwLock::new(DaemonState::Initializing),
            started_at: Utc::now(),
            lifecycle: AsyncMutex::new(Lifecycle::default()),
        };

        match daemon.run_maintenance().await {
            Ok(report) => tracing::debug!(?report, "Initial maintenance complete"),
            Err(e) => tracing::warn!(error = %e, "Initial maintenance failed"),
        }

        {
            let mut lifecycle = daemon.lifecycle.lock().await;
            let shutdown = lifecycle.begin();
            lifecycle.track(spawn_discovery_loop(
                Arc::clone(&daemon.adapters),
                Duration::from_secs(daemon.config.daemon.discovery_interval_secs),
                shutdown.clone(),
            ));
            lifecycle.track(spawn_maintenance_loop(
                Arc::clone(&daemon.db),
                Arc::clone(&daemon.adapters),
                daemon.config.daemon.clone(),
                shutdown,
            ));
        }

        daemon.set_state(DaemonState::Running);
        tracing::info!(
            adapters = daemon.adapters.len(),
            socket = %daemon.config.socket_path().display(),
            "Daemon running"
        );
        Ok(daemon)
    }

    pub fn state(&self) -> DaemonState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: DaemonState) {
        *self.state.write().unwrap() = state;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        run_maintenance(&self.db, &self.adapters, &self.config.daemon).await
    }

    /// Stop the loops, then every adapter, then drain the bus
    pub async fn stop(&self) {
        if matches!(self.state(), DaemonState::ShuttingDown | DaemonState::Stopped) {
            return;
        }
        self.set_state(DaemonState::ShuttingDown);
        tracing::info!("Daemon shutting down");

        self.lifecycle.lock().await.stop().await;
        for adapter in self.adapters.iter() {
            adapter.stop().await;
        }
        self.bus.shutdown().await;

        self.set_state(DaemonState::Stopped);
        tracing::info!("Daemon stopped");
    }

    /// Forward events matching `filter` to `sink` as protocol lines
    pub fn subscribe(&self, filter: EventFilter, sink: UnboundedSender<String>) -> SubscriptionId {
        let db = Arc::clone(&self.db);
        self.bus.subscribe(WILDCARD, move |event| {
            let filter = filter.clone();
            let sink = sink.clone();
            let db = Arc::clone(&db);
            async move {
                let project = if filter.needs_project() {
                    db.get_session(&event.session_id)?.map(|s| s.project_path)
                } else {
                    None
                };
                if filter.matches(&event, project.as_deref()) {
                    // A closed sink means the client left; the server unsubscribes
                    let _ = sink.send(encode_line(&event_message(&event))?);
                }
                Ok(())
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Answer one IPC request. Failures become `{"ok": false}` responses.
    pub async fn handle_request(&self, request: Request) -> Response {
        let action = request.action();
        match self.dispatch(request).await {
            Ok(payload) => Response::ok(payload),
            Err(e) => {
                tracing::debug!(action, error = %e, "Request failed");
                Response::from(e)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        match request {
            Request::GetStatus => self.status().await,
            Request::GetSessions { agent_types, limit } => {
                let sessions = self
                    .db
                    .get_active_sessions(&agent_types, limit.unwrap_or(DEFAULT_LIMIT))?;
                Ok(json!({ "sessions": sessions }))
            }
            Request::GetSession { session_id } => {
                let session = self
                    .db
                    .get_session(&session_id)?
                    .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?;
                let events = self
                    .db
                    .get_session_events(&session_id, &[], SESSION_DETAIL_EVENTS)?;
                Ok(json!({ "session": session, "events": events }))
            }
            Request::GetMetrics { agent_type, hours } => {
                let hours = hours.unwrap_or(DEFAULT_METRICS_HOURS).max(1);
                let summary = self.db.get_summary_metrics(agent_type, hours)?;
                let hourly = self
                    .db
                    .get_hourly_metrics(agent_type, Utc::now() - ChronoDuration::hours(hours))?;
                Ok(json!({ "metrics": summary, "hourly": hourly }))
            }
            Request::GetEvents {
                session_id,
                minutes,
                event_types,
                limit,
            } => {
                let limit = limit.unwrap_or(DEFAULT_LIMIT);
                let events = match session_id {
                    Some(id) => self.db.get_session_events(&id, &event_types, limit)?,
                    None => self.db.get_recent_events(
                        minutes.unwrap_or(DEFAULT_EVENTS_MINUTES),
                        &event_types,
                        limit,
                    )?,
                };
                Ok(json!({ "events": events }))
            }
            Request::HookEvent {
                event_type,
                data,
                timestamp,
            } => {
                let data = if data.is_null() { json!({}) } else { data };
                let payload: HookPayload = serde_json::from_value(data)
                    .map_err(|e| Error::InvalidRecord(format!("hook payload: {}", e)))?;
                let kind = payload.resolve_kind(&event_type)?;
                let adapter = self
                    .adapters
                    .iter()
                    .find(|a| a.agent_type() == AgentType::ClaudeCode)
                    .ok_or_else(|| Error::Ipc("claude_code adapter is not enabled".into()))?;
                match adapter.handle_hook(kind, payload, timestamp).await {
                    Some(result) => Ok(json!({ "status": "received", "session_id": result? })),
                    None => Err(Error::Ipc("adapter does not accept hooks".into())),
                }
            }
            Request::Subscribe { .. } | Request::Unsubscribe => Err(Error::Ipc(
                "subscriptions are only available on a socket connection".into(),
            )),
        }
    }

    async fn status(&self) -> Result<Value> {
        let mut adapters = Vec::with_capacity(self.adapters.len());
        for adapter in self.adapters.iter() {
            adapters.push(json!({
                "name": adapter.name(),
                "agent_type": adapter.agent_type(),
                "running": adapter.is_running().await,
                "capabilities": adapter.capabilities(),
            }));
        }
        let by_status = self.db.count_sessions_by_status()?;
        let active = by_status.get("active").copied().unwrap_or(0);

        Ok(json!({
            "state": self.state(),
            "started_at": self.started_at,
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
            "adapters": adapters,
            "active_sessions": active,
            "sessions_by_status": by_status,
            "total_events": self.db.count_events()?,
            "events": {
                "pending": self.bus.pending_count(),
                "dropped": self.bus.dropped_count(),
                "dispatched": self.bus.dispatched_count(),
                "subscribers": self.bus.subscriber_count(),
                "by_type": self.tracker.counts(),
                "last_event_at": self.tracker.last_event_at(),
            },
        }))
    }
}

/// Dedup sweep, stale sweep, cache reload, then rollups for the previous and
/// current hour of every adapter's agent type
pub async fn run_maintenance(
    db: &Database,
    adapters: &[Adapter],
    config: &DaemonConfig,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport {
        dedup: db.deduplicate_sessions()?,
        ..Default::default()
    };

    report.stale_sessions = db.cleanup_stale_sessions(config.stale_after_hours, !config.delete_stale)?;

    // Caches still hold the pre-sweep copies until reloaded
    for adapter in adapters {
        match adapter.reload_cache().await {
            Ok(n) => report.cache_entries_dropped += n,
            Err(e) => tracing::warn!(adapter = adapter.name(), error = %e, "Cache reload failed"),
        }
    }

    let current_hour = Utc::now()
        .duration_trunc(ChronoDuration::hours(1))
        .unwrap_or_else(|_| Utc::now());
    let mut agent_types: Vec<AgentType> = adapters.iter().map(|a| a.agent_type()).collect();
    agent_types.sort();
    agent_types.dedup();
    for agent_type in agent_types {
        for hour in [current_hour - ChronoDuration::hours(1), current_hour] {
            match db.update_hourly_metrics(agent_type, hour) {
                Ok(_) => report.metrics_updated += 1,
                Err(e) => tracing::warn!(agent = %agent_type, error = %e, "Hourly rollup failed"),
            }
        }
    }

    if report.dedup.duplicates_removed > 0 || report.stale_sessions > 0 {
        tracing::info!(
            duplicates_removed = report.dedup.duplicates_removed,
            events_migrated = report.dedup.events_migrated,
            stale_sessions = report.stale_sessions,
            "Maintenance pass"
        );
    }
    Ok(report)
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn spawn_discovery_loop(
    adapters: Arc<Vec<Adapter>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // start() already ran the first discovery
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for adapter in adapters.iter() {
                        match adapter.discover().await {
                            Ok(sessions) => tracing::trace!(adapter = adapter.name(), sessions = sessions.len(), "Discovery pass"),
                            Err(e) => tracing::warn!(adapter = adapter.name(), error = %e, "Discovery failed"),
                        }
                    }
                }
            }
        }
        tracing::debug!("Discovery loop exited");
    })
}

fn spawn_maintenance_loop(
    db: Arc<Database>,
    adapters: Arc<Vec<Adapter>>,
    config: DaemonConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(config.maintenance_interval_secs));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = run_maintenance(&db, &adapters, &config).await {
                        tracing::warn!(error = %e, "Maintenance failed");
                    }
                }
            }
        }
        tracing::debug!("Maintenance loop exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SourceState;
    use crate::db::repo::ts;
    use crate::process::StaticProcesses;
    use crate::types::{Session, SessionStatus};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        daemon: Daemon,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.enabled_adapters = vec![AgentType::ClaudeCode];
        config.claude_code.home = Some(dir.path().join("claude"));
        config.daemon.socket_path = Some(dir.path().join("agentmon.sock"));

        let db = Arc::new(Database::open_in_memory().unwrap());
        let daemon = Daemon::start_with(
            config,
            db,
            Arc::new(StaticProcesses::default()),
            &dir.path().join("adapters"),
        )
        .await
        .unwrap();
        Fixture { _dir: dir, daemon }
    }

    fn hook(event_type: &str, data: Value) -> Request {
        Request::HookEvent {
            event_type: event_type.to_string(),
            data,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_status_reports_adapters_and_state() {
        let f = fixture().await;
        assert_eq!(f.daemon.state(), DaemonState::Running);

        let status = f.daemon.handle_request(Request::GetStatus).await;
        assert!(status.ok);
        assert_eq!(status.get("state").unwrap(), "running");
        let adapters = status.get("adapters").unwrap().as_array().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0]["name"], "claude_code");
        assert_eq!(adapters[0]["running"], true);
        assert_eq!(adapters[0]["capabilities"]["hook_integration"], true);

        f.daemon.stop().await;
        assert_eq!(f.daemon.state(), DaemonState::Stopped);
        assert!(!f.daemon.adapters()[0].is_running().await);
        assert!(f.daemon.bus().is_closed());
    }

    #[tokio::test]
    async fn test_hook_events_create_queryable_sessions() {
        let f = fixture().await;

        let response = f
            .daemon
            .handle_request(hook(
                "session_start",
                json!({"session_id": "abc", "cwd": "/repo", "source": "startup"}),
            ))
            .await;
        assert!(response.ok, "{:?}", response.error);
        let session_id: String = response.field("session_id").unwrap();

        let tool = f
            .daemon
            .handle_request(hook(
                "PreToolUse",
                json!({"session_id": "abc", "cwd": "/repo", "tool_name": "Bash", "tool_input": {"command": "ls"}}),
            ))
            .await;
        assert!(tool.ok);
        assert_eq!(tool.field::<String>("session_id").unwrap(), session_id);

        let sessions = f
            .daemon
            .handle_request(Request::GetSessions {
                agent_types: vec![AgentType::ClaudeCode],
                limit: None,
            })
            .await;
        let sessions: Vec<Session> = sessions.field("sessions").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].external_id, "abc");
        assert_eq!(sessions[0].tool_call_count, 1);

        let detail = f
            .daemon
            .handle_request(Request::GetSession {
                session_id: session_id.clone(),
            })
            .await;
        assert!(detail.ok);
        let events: Vec<SessionEvent> = detail.field("events").unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::ToolStart));

        let recent = f
            .daemon
            .handle_request(Request::GetEvents {
                session_id: None,
                minutes: Some(5),
                event_types: vec![EventType::ToolStart],
                limit: None,
            })
            .await;
        let recent: Vec<SessionEvent> = recent.field("events").unwrap();
        assert_eq!(recent.len(), 1);

        f.daemon.stop().await;
    }

    #[tokio::test]
    async fn test_request_errors() {
        let f = fixture().await;

        let missing = f
            .daemon
            .handle_request(Request::GetSession {
                session_id: "nope".into(),
            })
            .await;
        assert!(!missing.ok);
        assert!(missing.error.unwrap().contains("nope"));

        let no_id = f.daemon.handle_request(hook("stop", json!({}))).await;
        assert!(!no_id.ok);

        let unknown = f
            .daemon
            .handle_request(hook("reboot", json!({"session_id": "x"})))
            .await;
        assert!(!unknown.ok);

        let metrics = f
            .daemon
            .handle_request(Request::GetMetrics {
                agent_type: None,
                hours: None,
            })
            .await;
        assert!(metrics.ok);
        assert_eq!(metrics.get("metrics").unwrap()["hours"], 24);

        f.daemon.stop().await;
    }

    #[tokio::test]
    async fn test_subscription_filters_events() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = f.daemon.subscribe(
            EventFilter {
                event_types: vec![EventType::PromptReceived],
                ..Default::default()
            },
            tx,
        );

        f.daemon
            .handle_request(hook("prompt_submit", json!({"session_id": "p", "prompt": "hi"})))
            .await;

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let message: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(message["type"], "event");
        assert_eq!(message["data"]["event_type"], "prompt_received");
        // The session_start emitted for the new session was filtered out
        assert!(rx.try_recv().is_err());

        assert!(f.daemon.unsubscribe(id));
        f.daemon.stop().await;
    }

    #[tokio::test]
    async fn test_maintenance_sweeps() {
        let f = fixture().await;
        let db = f.daemon.database();

        let mut stale = Session::new(AgentType::ClaudeCode, "old", "/old");
        stale.last_activity_at = Utc::now() - ChronoDuration::hours(48);
        db.upsert_session(&stale).unwrap();

        let report = f.daemon.run_maintenance().await.unwrap();
        assert_eq!(report.stale_sessions, 1);
        assert_eq!(report.metrics_updated, 2);
        assert_eq!(
            db.get_session(&stale.id).unwrap().unwrap().status,
            SessionStatus::Completed
        );

        f.daemon.stop().await;
    }

    async fn hook_session_gone_stale(f: &Fixture, external_id: &str) -> String {
        let response = f
            .daemon
            .handle_request(hook(
                "session_start",
                json!({"session_id": external_id, "cwd": "/repo"}),
            ))
            .await;
        let id: String = response.field("session_id").unwrap();
        f.daemon
            .database()
            .connection()
            .execute(
                "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
                rusqlite::params![ts(&(Utc::now() - ChronoDuration::hours(48))), id],
            )
            .unwrap();
        id
    }

    async fn rediscover(f: &Fixture, external_id: &str) -> (String, bool) {
        let Adapter::ClaudeCode(claude) = &f.daemon.adapters()[0] else {
            panic!("expected the claude_code adapter");
        };
        let mut candidate = Session::new(AgentType::ClaudeCode, external_id, "/repo");
        candidate.status = SessionStatus::Completed;
        claude
            .with_state(|state| state.reconciler().find_or_merge(candidate))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_swept_sessions_stay_completed_on_rediscovery() {
        let f = fixture().await;
        let id = hook_session_gone_stale(&f, "swept").await;

        let report = f.daemon.run_maintenance().await.unwrap();
        assert_eq!(report.stale_sessions, 1);

        let (merged, created) = rediscover(&f, "swept").await;
        assert_eq!(merged, id);
        assert!(!created);
        let stored = f.daemon.database().get_session(&id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert!(stored.ended_at.is_some());

        f.daemon.stop().await;
    }

    #[tokio::test]
    async fn test_deleted_stale_sessions_are_not_written_back() {
        let f = fixture().await;
        let id = hook_session_gone_stale(&f, "purged").await;

        let mut config = f.daemon.config().daemon.clone();
        config.delete_stale = true;
        let report = run_maintenance(f.daemon.database(), f.daemon.adapters(), &config)
            .await
            .unwrap();
        assert_eq!(report.stale_sessions, 1);
        assert_eq!(report.cache_entries_dropped, 1);

        let (new_id, created) = rediscover(&f, "purged").await;
        assert!(created);
        assert_ne!(new_id, id);
        assert!(f.daemon.database().get_session(&id).unwrap().is_none());

        f.daemon.stop().await;
    }
}
