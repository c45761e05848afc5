//! Session reconciliation shared by every adapter
//!
//! A [`Reconciler`] owns one adapter's in-memory session cache. Candidates
//! from any detection technique pass through [`Reconciler::find_or_merge`]:
//!
//! 1. cache hit on `external_id` → existing session
//! 2. store hit on `(agent_type, external_id)` → loaded into the cache
//! 3. otherwise the candidate is persisted as a new session
//!
//! When an existing session is returned, the candidate is merged into it:
//! activity is touched, pid and project path are adopted only when missing,
//! counters are raised to the candidate's, and metadata is unioned with the
//! candidate winning on collisions.

use crate::bus::EventBus;
use crate::config::CostPolicy;
use crate::db::Database;
use crate::error::Result;
use crate::ingest::{Delta, DeltaKind};
use crate::pricing::PricingTable;
use crate::process::ProcessSource;
use crate::types::{
    is_unknown_project, AgentType, EventType, FileOperation, Session, SessionEvent, SessionStatus,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Sessions loaded from the store when an adapter starts
const WARM_CACHE_LIMIT: usize = 500;

/// Metadata key naming the manifest adapter that owns a session
pub const OWNER_KEY: &str = "plugin";

/// Shared collaborators handed to every adapter
#[derive(Clone)]
pub struct AdapterContext {
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub pricing: Arc<PricingTable>,
    pub processes: Arc<dyn ProcessSource>,
}

/// Short stable hash used to synthesize external ids
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..6])
}

/// Drop candidates repeating an external id or a known project path already
/// produced earlier in the same discovery pass. Earlier techniques win.
pub fn dedup_candidates(candidates: Vec<Session>) -> Vec<Session> {
    let mut seen_ids = HashSet::new();
    let mut seen_projects = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| {
            if !seen_ids.insert(c.external_id.clone()) {
                return false;
            }
            if c.has_known_project() {
                return seen_projects.insert(c.project_path.clone());
            }
            true
        })
        .collect()
}

/// Event type for a tool invocation, by tool name
pub fn classify_tool(name: &str) -> EventType {
    match name {
        "Read" | "Glob" | "Grep" => EventType::FileRead,
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => EventType::FileModified,
        _ => EventType::ToolExecuted,
    }
}

fn file_event_type(operation: FileOperation) -> EventType {
    match operation {
        FileOperation::Read => EventType::FileRead,
        FileOperation::Write => EventType::FileWrite,
        FileOperation::Edit => EventType::FileEdit,
        FileOperation::Delete => EventType::FileDelete,
        FileOperation::Modified => EventType::FileModified,
    }
}

/// How deltas from one source are turned into events
#[derive(Debug, Clone, Copy)]
pub struct DeltaPolicy {
    /// Confidence stamped on emitted events
    pub confidence: f64,
    pub cost_policy: CostPolicy,
}

impl Default for DeltaPolicy {
    fn default() -> Self {
        Self {
            confidence: 1.0,
            cost_policy: CostPolicy::Sum,
        }
    }
}

// ============================================
// Cache
// ============================================

/// Per-adapter session cache keyed by internal id
#[derive(Debug, Default)]
pub struct SessionCache {
    sessions: HashMap<String, Session>,
}

impl SessionCache {
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Internal id of the cached session with this external id
    pub fn id_for_external(&self, external_id: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|s| s.external_id == external_id)
            .map(|s| s.id.clone())
    }

    /// Most recently active cached session for exactly this project.
    /// Parent and child directories are different projects.
    pub fn id_for_project(&self, path: &str) -> Option<String> {
        if is_unknown_project(path) {
            return None;
        }
        let wanted = path.trim_end_matches('/');
        self.sessions
            .values()
            .filter(|s| s.project_path.trim_end_matches('/') == wanted)
            .max_by_key(|s| s.last_activity_at)
            .map(|s| s.id.clone())
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================
// Reconciler
// ============================================

/// One adapter's view of its sessions: cache plus the shared store and bus.
///
/// Adapters sharing an agent type (every manifest adapter is `custom`) set an
/// owner so each one only caches, and only ends, its own sessions.
pub struct Reconciler {
    agent_type: AgentType,
    owner: Option<String>,
    ctx: AdapterContext,
    cache: SessionCache,
}

impl Reconciler {
    pub fn new(agent_type: AgentType, ctx: AdapterContext) -> Self {
        Self {
            agent_type,
            owner: None,
            ctx,
            cache: SessionCache::default(),
        }
    }

    /// Restrict this reconciler to sessions whose [`OWNER_KEY`] metadata is `owner`
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Whether a stored session belongs to this reconciler
    pub fn owns(&self, session: &Session) -> bool {
        match &self.owner {
            None => true,
            Some(owner) => {
                session.metadata.get(OWNER_KEY).and_then(|v| v.as_str()) == Some(owner.as_str())
            }
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.cache.get(id)
    }

    /// Fill the cache with this adapter's active sessions from the store
    pub fn warm_cache(&mut self) -> Result<usize> {
        let sessions = self
            .ctx
            .db
            .get_active_sessions(&[self.agent_type], WARM_CACHE_LIMIT)?;
        let owned: Vec<Session> = sessions.into_iter().filter(|s| self.owns(s)).collect();
        let count = owned.len();
        for session in owned {
            self.cache.insert(session);
        }
        Ok(count)
    }

    /// Reconcile a candidate. Returns the canonical session id and whether a
    /// new session was created.
    pub fn find_or_merge(&mut self, candidate: Session) -> Result<(String, bool)> {
        if let Some(id) = self.cache.id_for_external(&candidate.external_id) {
            self.merge_into(&id, &candidate)?;
            return Ok((id, false));
        }

        if let Some(stored) = self
            .ctx
            .db
            .get_session_by_external_id(self.agent_type, &candidate.external_id)?
        {
            let id = stored.id.clone();
            self.cache.insert(stored);
            self.merge_into(&id, &candidate)?;
            return Ok((id, false));
        }

        let mut session = candidate;
        session.agent_type = self.agent_type;
        self.refresh_cost(&mut session);
        self.ctx.db.upsert_session(&session)?;

        tracing::info!(
            agent = %self.agent_type,
            session_id = %session.id,
            external_id = %session.external_id,
            project = %session.project_path,
            "New session"
        );

        let id = session.id.clone();
        let mut start = SessionEvent::new(&id, EventType::SessionStart, self.agent_type)
            .at(session.started_at)
            .with_content(&session.project_path);
        if let Some(source) = session.metadata.get("source") {
            start = start.with_meta("source", source.clone());
        }
        self.cache.insert(session);
        self.emit(start);
        Ok((id, true))
    }

    /// Deduplicate one discovery pass and reconcile every survivor. A failed
    /// candidate is logged and skipped.
    pub fn reconcile_candidates(&mut self, candidates: Vec<Session>) -> Vec<Session> {
        let mut sessions = Vec::new();
        for candidate in dedup_candidates(candidates) {
            let external_id = candidate.external_id.clone();
            match self.find_or_merge(candidate) {
                Ok((id, _)) => {
                    if let Some(session) = self.cache.get(&id) {
                        sessions.push(session.clone());
                    }
                }
                Err(e) => tracing::warn!(
                    agent = %self.agent_type,
                    external_id = %external_id,
                    error = %e,
                    "Failed to reconcile candidate"
                ),
            }
        }
        sessions
    }

    fn merge_into(&mut self, id: &str, candidate: &Session) -> Result<()> {
        let pricing = Arc::clone(&self.ctx.pricing);
        let Some(existing) = self.cache.get_mut(id) else {
            return Ok(());
        };

        existing.touch_at(candidate.last_activity_at.max(existing.last_activity_at));
        if existing.pid.is_none() {
            existing.pid = candidate.pid;
        }
        if !existing.has_known_project() && candidate.has_known_project() {
            existing.project_path = candidate.project_path.clone();
        }
        if existing.model_id.is_none() {
            existing.model_id = candidate.model_id.clone();
        }
        existing.absorb_counters(candidate);
        existing.merge_metadata(&candidate.metadata);

        // An active observation reopens; nothing else demotes a live session
        if candidate.status == SessionStatus::Active && existing.status != SessionStatus::Active {
            existing.status = SessionStatus::Active;
            existing.ended_at = None;
            existing.recompute_duration();
        }

        refresh_cost(&pricing, existing);
        self.ctx.db.upsert_session(existing)?;
        Ok(())
    }

    /// Apply `f` to a cached session and persist the result
    pub fn update<F>(&mut self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Session),
    {
        let pricing = Arc::clone(&self.ctx.pricing);
        let Some(session) = self.cache.get_mut(id) else {
            return Ok(());
        };
        f(session);
        refresh_cost(&pricing, session);
        self.ctx.db.upsert_session(session)
    }

    /// Store an event and publish it. Storage failures are logged; the
    /// event is still published.
    pub fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.ctx.db.insert_event(&event) {
            tracing::warn!(
                agent = %self.agent_type,
                session_id = %event.session_id,
                error = %e,
                "Failed to store event"
            );
        }
        self.ctx.bus.publish(event);
    }

    /// Apply decoded deltas to one session, emitting an event per delta and
    /// persisting the session once
    pub fn apply_deltas(&mut self, id: &str, deltas: &[Delta], policy: DeltaPolicy) -> Result<usize> {
        let agent_type = self.agent_type;
        let Some(session) = self.cache.get_mut(id) else {
            return Ok(0);
        };

        let mut events = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let at = delta.timestamp.unwrap_or_else(Utc::now);
            session.touch_at(at);
            if session.status.is_terminal() || session.status == SessionStatus::Idle {
                session.status = SessionStatus::Active;
                session.ended_at = None;
            }

            let event = match &delta.kind {
                DeltaKind::Prompt { text } => {
                    session.message_count += 1;
                    SessionEvent::new(id, EventType::PromptReceived, agent_type).with_content(text)
                }
                DeltaKind::Response { text } => {
                    SessionEvent::new(id, EventType::ResponseGenerated, agent_type).with_content(text)
                }
                DeltaKind::Thinking { text } => {
                    SessionEvent::new(id, EventType::Thinking, agent_type).with_content(text)
                }
                DeltaKind::ToolUse { name, input } => {
                    session.tool_call_count += 1;
                    let event_type = classify_tool(name);
                    if event_type == EventType::FileModified {
                        session.file_operations += 1;
                    }
                    let summary = match input {
                        Some(v) => format!("{}: {}", name, v),
                        None => name.clone(),
                    };
                    let mut event = SessionEvent::new(id, event_type, agent_type)
                        .with_tool(name.clone(), input.clone())
                        .with_content(&summary);
                    if let Some(path) = input
                        .as_ref()
                        .and_then(|v| v.get("file_path").or_else(|| v.get("path")))
                        .and_then(|v| v.as_str())
                    {
                        if let Some(op) = event_type.file_operation() {
                            event = event.with_file(path, op);
                        }
                    }
                    event
                }
                DeltaKind::FileTouched { path, operation } => {
                    if operation.is_mutation() {
                        session.file_operations += 1;
                    }
                    SessionEvent::new(id, file_event_type(*operation), agent_type)
                        .with_file(path.clone(), *operation)
                        .with_content(path)
                }
                DeltaKind::Tokens { input, output } => {
                    session.add_tokens(*input, *output);
                    SessionEvent::new(id, EventType::TokenUsage, agent_type)
                        .with_tokens(*input, *output)
                }
                DeltaKind::Cost {
                    amount,
                    session_total,
                } => {
                    match policy.cost_policy {
                        CostPolicy::Sum => session.estimated_cost += amount.max(0.0),
                        CostPolicy::Latest => {
                            let latest = session_total.unwrap_or(*amount);
                            session.estimated_cost = session.estimated_cost.max(latest);
                        }
                    }
                    SessionEvent::new(id, EventType::CostEstimate, agent_type).with_cost(*amount)
                }
                DeltaKind::Model { model } => {
                    session.model_id = Some(model.clone());
                    continue;
                }
                DeltaKind::Custom { name, text } => {
                    let event_type = EventType::from_str(name).unwrap_or(EventType::Custom);
                    match event_type {
                        EventType::PromptReceived => session.message_count += 1,
                        EventType::ToolExecuted | EventType::ToolStart => {
                            session.tool_call_count += 1
                        }
                        t if t.file_operation().map(|op| op.is_mutation()).unwrap_or(false) => {
                            session.file_operations += 1
                        }
                        _ => {}
                    }
                    let mut event =
                        SessionEvent::new(id, event_type, agent_type).with_content(text);
                    if event_type == EventType::Custom {
                        event = event.with_meta("name", name.clone());
                    }
                    event
                }
            };

            let mut event = event.at(at).with_confidence(policy.confidence);
            if let Some(model) = &session.model_id {
                event.model_used = Some(model.clone());
            }
            if let Some(cwd) = &delta.cwd {
                event = event.with_meta("cwd", cwd.clone());
            }
            if let Some(raw) = &delta.raw {
                event = event.with_raw(raw.clone());
            }
            events.push(event);
        }

        refresh_cost(&self.ctx.pricing, session);
        self.ctx.db.upsert_session(session)?;

        let count = events.len();
        for event in events {
            self.emit(event);
        }
        Ok(count)
    }

    /// Complete ACTIVE sessions whose process is no longer running.
    /// Returns the ids of the sessions that ended.
    pub fn detect_ended(&mut self, live_pids: &HashSet<u32>) -> Result<Vec<String>> {
        let ended: Vec<String> = self
            .cache
            .sessions()
            .filter(|s| s.status == SessionStatus::Active && self.owns(s))
            .filter(|s| s.pid.map(|pid| !live_pids.contains(&pid)).unwrap_or(false))
            .map(|s| s.id.clone())
            .collect();

        for id in &ended {
            self.update(id, |s| s.end(SessionStatus::Completed))?;
            tracing::info!(agent = %self.agent_type, session_id = %id, "Session process ended");
            self.emit(SessionEvent::new(id, EventType::SessionEnd, self.agent_type).with_meta(
                "reason",
                "process_exited",
            ));
        }
        Ok(ended)
    }

    /// Refresh cached sessions from the store, dropping ones that no longer
    /// exist (for example, losers of a dedup sweep)
    pub fn reload_cache(&mut self) -> Result<usize> {
        let mut dropped = 0;
        for id in self.cache.ids() {
            match self.ctx.db.get_session(&id)? {
                Some(stored) if self.owns(&stored) => self.cache.insert(stored),
                _ => {
                    self.cache.remove(&id);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::debug!(agent = %self.agent_type, dropped, "Dropped stale cache entries");
        }
        Ok(dropped)
    }

    fn refresh_cost(&self, session: &mut Session) {
        refresh_cost(&self.ctx.pricing, session);
    }
}

/// Raise the session's cost to the token-based estimate; never lowers it
pub fn refresh_cost(pricing: &PricingTable, session: &mut Session) {
    if session.tokens_input == 0 && session.tokens_output == 0 {
        return;
    }
    let estimate = pricing.cost(
        session.model_id.as_deref(),
        session.tokens_input,
        session.tokens_output,
    );
    if estimate > session.estimated_cost {
        session.estimated_cost = estimate;
    }
}

// ============================================
// Lifecycle
// ============================================

/// Background tasks of a started adapter plus their shutdown signal
#[derive(Default)]
pub struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Lifecycle {
    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Open a new shutdown channel and return a receiver for loops
    pub fn begin(&mut self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        rx
    }

    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Signal every loop and wait for all of them to exit
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Adapter task failed");
            }
        }
    }
}
