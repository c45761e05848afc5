//! Session store
//!
//! The single authority for durable session and event state. Every read and
//! write of session identity goes through [`Database`]; callers never reach
//! around it to the connection.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings (microsecond
//! precision, `Z` suffix) so lexical comparison in SQL matches time order.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Duration, DurationRound, SecondsFormat, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Format a timestamp for storage
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now on garbage
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json_map(s: &str) -> Metadata {
    serde_json::from_str(s).unwrap_or_default()
}

/// Filters for [`Database::list_sessions`]
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Restrict to these agent types (empty = all)
    pub agent_types: Vec<AgentType>,
    /// Filter by status
    pub status: Option<SessionStatus>,
    /// Filter by exact project path
    pub project_path: Option<String>,
    /// Filter by OS process id
    pub pid: Option<u32>,
    /// Only sessions active after this time
    pub active_since: Option<DateTime<Utc>>,
    /// Maximum number of sessions to return
    pub limit: usize,
}

/// Database handle (single connection, serialized by a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path, applying pending migrations
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -16000;  -- 16MB cache
            ",
        )?;
        super::schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a migrated in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply pending migrations. `open` already does this; calling it again
    /// is a no-op.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Session operations
    // ============================================

    /// Insert or update a session keyed by its internal id.
    ///
    /// Immutable fields (id, agent type, external id, created time) are only
    /// written on insert. Counters, tokens and cost never decrease, pid and
    /// model are only replaced by known values, a known project path is never
    /// replaced by the unknown sentinel, and metadata is merged key by key.
    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        validate_session(session)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT metadata FROM sessions WHERE id = ?1",
                [&session.id],
                |r| r.get(0),
            )
            .optional()?;
        let mut metadata = stored.map(|s| parse_json_map(&s)).unwrap_or_default();
        for (key, value) in &session.metadata {
            metadata.insert(key.clone(), value.clone());
        }

        tx.execute(
            r#"
            INSERT INTO sessions (
                id, agent_type, external_id, project_path, status,
                started_at, last_activity_at, ended_at, duration_seconds,
                message_count, tool_call_count, file_operations,
                tokens_input, tokens_output, estimated_cost,
                model_id, pid, current_task, progress,
                created_at, updated_at, metadata
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            ON CONFLICT(id) DO UPDATE SET
                project_path = CASE
                    WHEN excluded.project_path IN ('', '/') THEN sessions.project_path
                    ELSE excluded.project_path
                END,
                status = excluded.status,
                started_at = MIN(sessions.started_at, excluded.started_at),
                last_activity_at = MAX(sessions.last_activity_at, excluded.last_activity_at),
                ended_at = excluded.ended_at,
                duration_seconds = excluded.duration_seconds,
                message_count = MAX(sessions.message_count, excluded.message_count),
                tool_call_count = MAX(sessions.tool_call_count, excluded.tool_call_count),
                file_operations = MAX(sessions.file_operations, excluded.file_operations),
                tokens_input = MAX(sessions.tokens_input, excluded.tokens_input),
                tokens_output = MAX(sessions.tokens_output, excluded.tokens_output),
                estimated_cost = MAX(sessions.estimated_cost, excluded.estimated_cost),
                model_id = COALESCE(excluded.model_id, sessions.model_id),
                pid = COALESCE(excluded.pid, sessions.pid),
                current_task = COALESCE(excluded.current_task, sessions.current_task),
                progress = COALESCE(excluded.progress, sessions.progress),
                updated_at = excluded.updated_at,
                metadata = excluded.metadata
            "#,
            params![
                session.id,
                session.agent_type.as_str(),
                session.external_id,
                session.project_path,
                session.status.as_str(),
                ts(&session.started_at),
                ts(&session.last_activity_at),
                session.ended_at.as_ref().map(ts),
                session.duration_seconds,
                session.message_count,
                session.tool_call_count,
                session.file_operations,
                session.tokens_input,
                session.tokens_output,
                session.estimated_cost,
                session.model_id,
                session.pid,
                session.current_task,
                session.progress,
                ts(&session.created_at),
                ts(&Utc::now()),
                serde_json::Value::Object(metadata).to_string(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Get a session by internal id
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get a session by external identity.
    ///
    /// If duplicates exist, the most recently active one is returned.
    pub fn get_session_by_external_id(
        &self,
        agent_type: AgentType,
        external_id: &str,
    ) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT * FROM sessions
            WHERE agent_type = ?1 AND external_id = ?2
            ORDER BY last_activity_at DESC
            LIMIT 1
            "#,
            params![agent_type.as_str(), external_id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List sessions with filtering, most recently active first
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if !filter.agent_types.is_empty() {
            sql.push_str(&format!(
                " AND agent_type IN ({})",
                placeholders(filter.agent_types.len())
            ));
            for agent_type in &filter.agent_types {
                params.push(Box::new(agent_type.as_str().to_string()));
            }
        }

        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }

        if let Some(project_path) = &filter.project_path {
            sql.push_str(" AND project_path = ?");
            params.push(Box::new(project_path.clone()));
        }

        if let Some(pid) = filter.pid {
            sql.push_str(" AND pid = ?");
            params.push(Box::new(pid));
        }

        if let Some(since) = &filter.active_since {
            sql.push_str(" AND last_activity_at > ?");
            params.push(Box::new(ts(since)));
        }

        sql.push_str(" ORDER BY last_activity_at DESC LIMIT ?");
        params.push(Box::new(filter.limit as i64));

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_refs.as_slice(), Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// ACTIVE sessions, optionally restricted to some agent types
    pub fn get_active_sessions(
        &self,
        agent_types: &[AgentType],
        limit: usize,
    ) -> Result<Vec<Session>> {
        self.list_sessions(&SessionFilter {
            agent_types: agent_types.to_vec(),
            status: Some(SessionStatus::Active),
            limit,
            ..Default::default()
        })
    }

    /// Sessions with activity in the last `hours` hours
    pub fn get_recent_sessions(&self, hours: i64, limit: usize) -> Result<Vec<Session>> {
        self.list_sessions(&SessionFilter {
            active_since: Some(Utc::now() - Duration::hours(hours)),
            limit,
            ..Default::default()
        })
    }

    /// Sessions for one project directory
    pub fn get_sessions_by_project(&self, project_path: &str, limit: usize) -> Result<Vec<Session>> {
        self.list_sessions(&SessionFilter {
            project_path: Some(project_path.to_string()),
            limit,
            ..Default::default()
        })
    }

    /// Sessions recorded for an OS process id
    pub fn find_sessions_by_pid(
        &self,
        pid: u32,
        agent_type: Option<AgentType>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        self.list_sessions(&SessionFilter {
            agent_types: agent_type.into_iter().collect(),
            pid: Some(pid),
            limit,
            ..Default::default()
        })
    }

    /// Session counts keyed by status
    pub fn count_sessions_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sessions GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let agent_type_str: String = row.get("agent_type")?;
        let status_str: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let last_activity_at: String = row.get("last_activity_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        let created_at: String = row.get("created_at")?;
        let metadata: String = row.get("metadata")?;

        Ok(Session {
            id: row.get("id")?,
            agent_type: agent_type_str.parse().unwrap_or(AgentType::Custom),
            external_id: row.get("external_id")?,
            project_path: row.get("project_path")?,
            status: status_str.parse().unwrap_or(SessionStatus::Unknown),
            started_at: parse_ts(&started_at),
            last_activity_at: parse_ts(&last_activity_at),
            ended_at: ended_at.as_deref().map(parse_ts),
            duration_seconds: row.get("duration_seconds")?,
            message_count: row.get("message_count")?,
            tool_call_count: row.get("tool_call_count")?,
            file_operations: row.get("file_operations")?,
            tokens_input: row.get("tokens_input")?,
            tokens_output: row.get("tokens_output")?,
            estimated_cost: row.get("estimated_cost")?,
            model_id: row.get("model_id")?,
            pid: row.get("pid")?,
            current_task: row.get("current_task")?,
            progress: row.get("progress")?,
            created_at: parse_ts(&created_at),
            metadata: parse_json_map(&metadata),
        })
    }

    // ============================================
    // Event operations
    // ============================================

    /// Append an event.
    ///
    /// The owning session does not have to exist yet. Re-inserting an event
    /// with an id already stored is a no-op.
    pub fn insert_event(&self, event: &SessionEvent) -> Result<()> {
        if event.id.is_empty() || event.session_id.is_empty() {
            return Err(Error::InvalidRecord(
                "event id and session_id are required".to_string(),
            ));
        }
        if !event.confidence.is_finite() || !(0.0..=1.0).contains(&event.confidence) {
            return Err(Error::InvalidRecord(format!(
                "event confidence out of range: {}",
                event.confidence
            )));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO session_events (
                id, session_id, event_type, timestamp, agent_type, content,
                tool_name, tool_input, tool_output, tool_duration_ms, tool_success,
                file_path, file_operation,
                tokens_input, tokens_output, estimated_cost, model_used,
                parent_session_id, subagent_task, error_type, error_message,
                confidence, metadata, raw_data
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            "#,
            params![
                event.id,
                event.session_id,
                event.event_type.as_str(),
                ts(&event.timestamp),
                event.agent_type.as_str(),
                event.content,
                event.tool_name,
                event.tool_input.as_ref().map(|v| v.to_string()),
                event.tool_output.as_ref().map(|v| v.to_string()),
                event.tool_duration_ms,
                event.tool_success,
                event.file_path,
                event.file_operation.map(|op| op.as_str()),
                event.tokens_input,
                event.tokens_output,
                event.estimated_cost,
                event.model_used,
                event.parent_session_id,
                event.subagent_task,
                event.error_type,
                event.error_message,
                event.confidence,
                serde_json::Value::Object(event.metadata.clone()).to_string(),
                event.raw_data.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Events for one session, newest first
    pub fn get_session_events(
        &self,
        session_id: &str,
        event_types: &[EventType],
        limit: usize,
    ) -> Result<Vec<SessionEvent>> {
        self.query_events(
            "session_id = ?",
            Box::new(session_id.to_string()),
            event_types,
            limit,
        )
    }

    /// Events across all sessions from the last `minutes` minutes, newest first
    pub fn get_recent_events(
        &self,
        minutes: i64,
        event_types: &[EventType],
        limit: usize,
    ) -> Result<Vec<SessionEvent>> {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        self.query_events("timestamp > ?", Box::new(ts(&cutoff)), event_types, limit)
    }

    /// Total stored events
    pub fn count_events(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM session_events", [], |r| r.get(0))?;
        Ok(count)
    }

    fn query_events(
        &self,
        condition: &str,
        value: Box<dyn rusqlite::ToSql>,
        event_types: &[EventType],
        limit: usize,
    ) -> Result<Vec<SessionEvent>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = format!("SELECT * FROM session_events WHERE {}", condition);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![value];

        if !event_types.is_empty() {
            sql.push_str(&format!(
                " AND event_type IN ({})",
                placeholders(event_types.len())
            ));
            for event_type in event_types {
                params.push(Box::new(event_type.as_str().to_string()));
            }
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        params.push(Box::new(limit as i64));

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_refs.as_slice(), Self::row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<SessionEvent> {
        let event_type_str: String = row.get("event_type")?;
        let agent_type_str: String = row.get("agent_type")?;
        let timestamp: String = row.get("timestamp")?;
        let tool_input: Option<String> = row.get("tool_input")?;
        let tool_output: Option<String> = row.get("tool_output")?;
        let file_operation: Option<String> = row.get("file_operation")?;
        let metadata: String = row.get("metadata")?;
        let raw_data: Option<String> = row.get("raw_data")?;

        Ok(SessionEvent {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            event_type: event_type_str.parse().unwrap_or(EventType::Custom),
            timestamp: parse_ts(&timestamp),
            agent_type: agent_type_str.parse().unwrap_or(AgentType::Custom),
            content: row.get("content")?,
            tool_name: row.get("tool_name")?,
            tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
            tool_output: tool_output.and_then(|s| serde_json::from_str(&s).ok()),
            tool_duration_ms: row.get("tool_duration_ms")?,
            tool_success: row.get("tool_success")?,
            file_path: row.get("file_path")?,
            file_operation: file_operation.and_then(|s| s.parse().ok()),
            tokens_input: row.get("tokens_input")?,
            tokens_output: row.get("tokens_output")?,
            estimated_cost: row.get("estimated_cost")?,
            model_used: row.get("model_used")?,
            parent_session_id: row.get("parent_session_id")?,
            subagent_task: row.get("subagent_task")?,
            error_type: row.get("error_type")?,
            error_message: row.get("error_message")?,
            confidence: row.get("confidence")?,
            metadata: parse_json_map(&metadata),
            raw_data: raw_data.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    // ============================================
    // Sweeps
    // ============================================

    /// Fold sessions sharing an external identity into one survivor.
    ///
    /// Members are ranked by `(message_count + tool_call_count)`, then input
    /// tokens, then last activity. The top-ranked row survives; the losers'
    /// events are re-parented onto it, their counters summed into it, and
    /// the losers deleted. Runs in a single transaction.
    pub fn deduplicate_sessions(&self) -> Result<DedupReport> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut report = DedupReport::default();

        let groups: Vec<(String, String, i64)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT agent_type, external_id, COUNT(*) AS cnt
                FROM sessions
                GROUP BY agent_type, external_id
                HAVING cnt > 1
                "#,
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for (agent_type, external_id, count) in groups {
            report.duplicates_found += (count - 1) as usize;

            let members: Vec<Session> = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT * FROM sessions
                    WHERE agent_type = ?1 AND external_id = ?2
                    ORDER BY (message_count + tool_call_count) DESC,
                             tokens_input DESC,
                             last_activity_at DESC
                    "#,
                )?;
                let rows = stmt
                    .query_map(params![agent_type, external_id], Self::row_to_session)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let Some((survivor, losers)) = members.split_first() else {
                continue;
            };
            let mut merged = survivor.clone();

            for loser in losers {
                report.events_migrated += tx.execute(
                    "UPDATE session_events SET session_id = ?1 WHERE session_id = ?2",
                    params![merged.id, loser.id],
                )?;

                merged.message_count += loser.message_count;
                merged.tool_call_count += loser.tool_call_count;
                merged.file_operations += loser.file_operations;
                merged.tokens_input += loser.tokens_input;
                merged.tokens_output += loser.tokens_output;
                merged.estimated_cost += loser.estimated_cost;
                merged.last_activity_at = merged.last_activity_at.max(loser.last_activity_at);
                merged.started_at = merged.started_at.min(loser.started_at);

                if merged.pid.is_none() {
                    merged.pid = loser.pid;
                }
                if merged.model_id.is_none() {
                    merged.model_id = loser.model_id.clone();
                }
                if !merged.has_known_project() && loser.has_known_project() {
                    merged.project_path = loser.project_path.clone();
                }
                for (key, value) in &loser.metadata {
                    merged
                        .metadata
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }

                report.duplicates_removed +=
                    tx.execute("DELETE FROM sessions WHERE id = ?1", [&loser.id])?;
            }
            merged.recompute_duration();

            tx.execute(
                r#"
                UPDATE sessions SET
                    project_path = ?2,
                    started_at = ?3,
                    last_activity_at = ?4,
                    duration_seconds = ?5,
                    message_count = ?6,
                    tool_call_count = ?7,
                    file_operations = ?8,
                    tokens_input = ?9,
                    tokens_output = ?10,
                    estimated_cost = ?11,
                    model_id = ?12,
                    pid = ?13,
                    metadata = ?14,
                    updated_at = ?15
                WHERE id = ?1
                "#,
                params![
                    merged.id,
                    merged.project_path,
                    ts(&merged.started_at),
                    ts(&merged.last_activity_at),
                    merged.duration_seconds,
                    merged.message_count,
                    merged.tool_call_count,
                    merged.file_operations,
                    merged.tokens_input,
                    merged.tokens_output,
                    merged.estimated_cost,
                    merged.model_id,
                    merged.pid,
                    serde_json::Value::Object(merged.metadata.clone()).to_string(),
                    ts(&Utc::now()),
                ],
            )?;

            tracing::info!(
                agent = %agent_type,
                external_id = %external_id,
                survivor = %merged.id,
                removed = losers.len(),
                "Merged duplicate sessions"
            );
        }

        tx.commit()?;
        Ok(report)
    }

    /// Close out ACTIVE sessions idle for longer than `inactive_hours`.
    ///
    /// With `mark_completed` the sessions become COMPLETED with
    /// `ended_at = last_activity_at`; otherwise they are deleted together with
    /// their events. Returns the number of sessions affected.
    pub fn cleanup_stale_sessions(&self, inactive_hours: i64, mark_completed: bool) -> Result<usize> {
        let cutoff = ts(&(Utc::now() - Duration::hours(inactive_hours)));

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stale: Vec<Session> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM sessions WHERE status = 'active' AND last_activity_at < ?1",
            )?;
            let rows = stmt
                .query_map([&cutoff], Self::row_to_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let now = ts(&Utc::now());
        for session in &stale {
            if mark_completed {
                let mut closed = session.clone();
                closed.status = SessionStatus::Completed;
                closed.ended_at = Some(closed.last_activity_at);
                closed.recompute_duration();
                tx.execute(
                    r#"
                    UPDATE sessions SET
                        status = ?2,
                        ended_at = last_activity_at,
                        duration_seconds = ?3,
                        updated_at = ?4
                    WHERE id = ?1
                    "#,
                    params![
                        closed.id,
                        closed.status.as_str(),
                        closed.duration_seconds,
                        now
                    ],
                )?;
            } else {
                tx.execute("DELETE FROM session_events WHERE session_id = ?1", [&session.id])?;
                tx.execute("DELETE FROM sessions WHERE id = ?1", [&session.id])?;
            }
        }

        tx.commit()?;

        if !stale.is_empty() {
            tracing::info!(
                count = stale.len(),
                inactive_hours,
                mode = if mark_completed { "complete" } else { "delete" },
                "Cleaned up stale sessions"
            );
        }
        Ok(stale.len())
    }

    // ============================================
    // Metrics
    // ============================================

    /// Dashboard totals over sessions started in the last `hours` hours
    pub fn get_summary_metrics(
        &self,
        agent_type: Option<AgentType>,
        hours: i64,
    ) -> Result<SummaryMetrics> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let sessions = self.sessions_started_between(agent_type, cutoff, Utc::now())?;

        let mut summary = SummaryMetrics {
            hours,
            ..Default::default()
        };
        let mut total_duration = 0i64;

        for session in &sessions {
            summary.total_sessions += 1;
            match session.status {
                SessionStatus::Active => summary.active_sessions += 1,
                SessionStatus::Completed => summary.completed_sessions += 1,
                SessionStatus::Crashed => summary.crashed_sessions += 1,
                _ => {}
            }
            summary.total_messages += session.message_count;
            summary.total_tool_calls += session.tool_call_count;
            summary.total_tokens_input += session.tokens_input;
            summary.total_tokens_output += session.tokens_output;
            summary.total_cost += session.estimated_cost;
            total_duration += session.duration_seconds;

            if let Some(model) = &session.model_id {
                *summary.model_usage.entry(model.clone()).or_insert(0) += 1;
            }
            *summary
                .hourly_distribution
                .entry(session.started_at.hour())
                .or_insert(0) += 1;
        }

        if summary.total_sessions > 0 {
            summary.avg_session_duration = total_duration as f64 / summary.total_sessions as f64;
        }
        Ok(summary)
    }

    /// Rollup for one agent over `[start, end)`
    pub fn get_agent_metrics(
        &self,
        agent_type: AgentType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AgentMetrics> {
        let sessions = self.sessions_started_between(Some(agent_type), start, end)?;

        let mut metrics = AgentMetrics {
            agent_type,
            period_start: start,
            period_end: end,
            session_count: 0,
            active_sessions: 0,
            message_count: 0,
            tool_call_count: 0,
            file_operations: 0,
            tokens_input: 0,
            tokens_output: 0,
            estimated_cost: 0.0,
            model_usage: BTreeMap::new(),
            hourly_distribution: BTreeMap::new(),
        };

        for session in &sessions {
            metrics.session_count += 1;
            if session.status == SessionStatus::Active {
                metrics.active_sessions += 1;
            }
            metrics.message_count += session.message_count;
            metrics.tool_call_count += session.tool_call_count;
            metrics.file_operations += session.file_operations;
            metrics.tokens_input += session.tokens_input;
            metrics.tokens_output += session.tokens_output;
            metrics.estimated_cost += session.estimated_cost;
            if let Some(model) = &session.model_id {
                *metrics.model_usage.entry(model.clone()).or_insert(0) += 1;
            }
            *metrics
                .hourly_distribution
                .entry(session.started_at.hour())
                .or_insert(0) += 1;
        }

        Ok(metrics)
    }

    /// Recompute and upsert the rollup for the hour containing `hour_start`
    pub fn update_hourly_metrics(
        &self,
        agent_type: AgentType,
        hour_start: DateTime<Utc>,
    ) -> Result<AgentMetrics> {
        let start = hour_start
            .duration_trunc(Duration::hours(1))
            .unwrap_or(hour_start);
        let metrics = self.get_agent_metrics(agent_type, start, start + Duration::hours(1))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO hourly_metrics (
                agent_type, hour_start, session_count, active_sessions,
                message_count, tool_call_count, file_operations,
                tokens_input, tokens_output, estimated_cost,
                model_usage, hourly_distribution, computed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(agent_type, hour_start) DO UPDATE SET
                session_count = excluded.session_count,
                active_sessions = excluded.active_sessions,
                message_count = excluded.message_count,
                tool_call_count = excluded.tool_call_count,
                file_operations = excluded.file_operations,
                tokens_input = excluded.tokens_input,
                tokens_output = excluded.tokens_output,
                estimated_cost = excluded.estimated_cost,
                model_usage = excluded.model_usage,
                hourly_distribution = excluded.hourly_distribution,
                computed_at = excluded.computed_at
            "#,
            params![
                agent_type.as_str(),
                ts(&start),
                metrics.session_count,
                metrics.active_sessions,
                metrics.message_count,
                metrics.tool_call_count,
                metrics.file_operations,
                metrics.tokens_input,
                metrics.tokens_output,
                metrics.estimated_cost,
                serde_json::to_string(&metrics.model_usage)?,
                serde_json::to_string(&metrics.hourly_distribution)?,
                ts(&Utc::now()),
            ],
        )?;

        Ok(metrics)
    }

    /// Persisted hourly rollups since `since`, oldest first
    pub fn get_hourly_metrics(
        &self,
        agent_type: Option<AgentType>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AgentMetrics>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM hourly_metrics
            WHERE hour_start >= ?1 AND (?2 IS NULL OR agent_type = ?2)
            ORDER BY hour_start ASC, agent_type ASC
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![ts(&since), agent_type.map(|a| a.as_str())],
                Self::row_to_hourly,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_hourly(row: &Row) -> rusqlite::Result<AgentMetrics> {
        let agent_type_str: String = row.get("agent_type")?;
        let hour_start: String = row.get("hour_start")?;
        let model_usage: String = row.get("model_usage")?;
        let hourly: String = row.get("hourly_distribution")?;
        let start = parse_ts(&hour_start);

        Ok(AgentMetrics {
            agent_type: agent_type_str.parse().unwrap_or(AgentType::Custom),
            period_start: start,
            period_end: start + Duration::hours(1),
            session_count: row.get("session_count")?,
            active_sessions: row.get("active_sessions")?,
            message_count: row.get("message_count")?,
            tool_call_count: row.get("tool_call_count")?,
            file_operations: row.get("file_operations")?,
            tokens_input: row.get("tokens_input")?,
            tokens_output: row.get("tokens_output")?,
            estimated_cost: row.get("estimated_cost")?,
            model_usage: serde_json::from_str(&model_usage).unwrap_or_default(),
            hourly_distribution: serde_json::from_str(&hourly).unwrap_or_default(),
        })
    }

    fn sessions_started_between(
        &self,
        agent_type: Option<AgentType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM sessions
            WHERE started_at >= ?1 AND started_at < ?2
              AND (?3 IS NULL OR agent_type = ?3)
            "#,
        )?;
        let sessions = stmt
            .query_map(
                params![ts(&start), ts(&end), agent_type.map(|a| a.as_str())],
                Self::row_to_session,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn validate_session(session: &Session) -> Result<()> {
    if session.id.is_empty() {
        return Err(Error::InvalidRecord("session id is required".to_string()));
    }
    if session.external_id.is_empty() {
        return Err(Error::InvalidRecord(format!(
            "session {} has no external_id",
            session.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_session(&create_test_session("fresh")).unwrap();
        assert_eq!(db.count_events().unwrap(), 0);
        db.migrate().unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/agentmon.db");
        let session = create_test_session("on-disk");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_session(&session).unwrap();
        }
        let reopened = Database::open(&path).unwrap();
        assert!(reopened.get_session(&session.id).unwrap().is_some());
        assert_eq!(
            crate::db::schema::get_schema_version(&reopened.connection()).unwrap(),
            crate::db::schema::SCHEMA_VERSION
        );
    }

    fn create_test_session(external_id: &str) -> Session {
        let mut session = Session::new(AgentType::ClaudeCode, external_id, "/repo");
        session.set_meta("source", "test");
        session
    }

    #[test]
    fn test_upsert_and_get_session() {
        let db = test_db();
        let session = create_test_session("sess-1");
        db.upsert_session(&session).unwrap();

        let loaded = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.external_id, "sess-1");
        assert_eq!(loaded.agent_type, AgentType::ClaudeCode);
        assert_eq!(loaded.metadata["source"], "test");
        assert_eq!(ts(&loaded.last_activity_at), ts(&session.last_activity_at));

        assert!(db.get_session("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_immutable_fields() {
        let db = test_db();
        let original = create_test_session("sess-1");
        db.upsert_session(&original).unwrap();

        let mut altered = original.clone();
        altered.agent_type = AgentType::Aider;
        altered.external_id = "other".to_string();
        altered.created_at = original.created_at + Duration::days(3);
        db.upsert_session(&altered).unwrap();

        let loaded = db.get_session(&original.id).unwrap().unwrap();
        assert_eq!(loaded.agent_type, AgentType::ClaudeCode);
        assert_eq!(loaded.external_id, "sess-1");
        assert_eq!(ts(&loaded.created_at), ts(&original.created_at));
    }

    #[test]
    fn test_upsert_never_lowers_counters() {
        let db = test_db();
        let mut session = create_test_session("sess-1");
        session.message_count = 10;
        session.tokens_input = 500;
        session.estimated_cost = 1.5;
        db.upsert_session(&session).unwrap();

        session.message_count = 3;
        session.tokens_input = 100;
        session.estimated_cost = 0.2;
        session.tool_call_count = 4;
        db.upsert_session(&session).unwrap();

        let loaded = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.message_count, 10);
        assert_eq!(loaded.tokens_input, 500);
        assert_eq!(loaded.estimated_cost, 1.5);
        assert_eq!(loaded.tool_call_count, 4);
    }

    #[test]
    fn test_upsert_merges_metadata_and_keeps_known_values() {
        let db = test_db();
        let mut session = create_test_session("sess-1");
        session.pid = Some(42);
        session.model_id = Some("claude-sonnet-4-20250514".to_string());
        db.upsert_session(&session).unwrap();

        let mut update = session.clone();
        update.pid = None;
        update.model_id = None;
        update.project_path = "/".to_string();
        update.metadata = Metadata::new();
        update.set_meta("transcript", "/tmp/t.jsonl");
        db.upsert_session(&update).unwrap();

        let loaded = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.pid, Some(42));
        assert_eq!(loaded.model_id.as_deref(), Some("claude-sonnet-4-20250514"));
        assert_eq!(loaded.project_path, "/repo");
        assert_eq!(loaded.metadata["source"], "test");
        assert_eq!(loaded.metadata["transcript"], "/tmp/t.jsonl");
    }

    #[test]
    fn test_upsert_rejects_missing_external_id() {
        let db = test_db();
        let session = Session::new(AgentType::Cursor, "", "/repo");
        assert!(matches!(
            db.upsert_session(&session),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_external_id_lookup_prefers_most_recent() {
        let db = test_db();
        let mut older = create_test_session("dup");
        older.last_activity_at = Utc::now() - Duration::hours(2);
        let newer = create_test_session("dup");
        db.upsert_session(&older).unwrap();
        db.upsert_session(&newer).unwrap();

        let found = db
            .get_session_by_external_id(AgentType::ClaudeCode, "dup")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);
        assert!(db
            .get_session_by_external_id(AgentType::Aider, "dup")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_filtered_reads() {
        let db = test_db();
        let mut a = create_test_session("a");
        a.pid = Some(7);
        let mut b = Session::new(AgentType::Aider, "b", "/other");
        b.status = SessionStatus::Completed;
        let mut c = create_test_session("c");
        c.last_activity_at = Utc::now() - Duration::hours(48);
        c.started_at = c.last_activity_at;
        for s in [&a, &b, &c] {
            db.upsert_session(s).unwrap();
        }

        let active = db.get_active_sessions(&[], 10).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, a.id);

        let aider_only = db.get_active_sessions(&[AgentType::Aider], 10).unwrap();
        assert!(aider_only.is_empty());

        let recent = db.get_recent_sessions(24, 10).unwrap();
        assert_eq!(recent.len(), 2);

        assert_eq!(db.get_sessions_by_project("/repo", 10).unwrap().len(), 2);
        assert_eq!(db.get_sessions_by_project("/repo", 1).unwrap().len(), 1);

        let by_pid = db.find_sessions_by_pid(7, Some(AgentType::ClaudeCode), 10).unwrap();
        assert_eq!(by_pid.len(), 1);
        assert!(db.find_sessions_by_pid(7, Some(AgentType::Cursor), 10).unwrap().is_empty());

        let counts = db.count_sessions_by_status().unwrap();
        assert_eq!(counts["active"], 2);
        assert_eq!(counts["completed"], 1);
    }

    #[test]
    fn test_insert_event_tolerates_missing_session() {
        let db = test_db();
        let event = SessionEvent::new("no-such-session", EventType::ToolStart, AgentType::ClaudeCode)
            .with_tool("Bash", Some(serde_json::json!({"command": "ls"})));
        db.insert_event(&event).unwrap();
        // Same id again is ignored
        db.insert_event(&event).unwrap();

        let events = db.get_session_events("no-such-session", &[], 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool_name.as_deref(), Some("Bash"));
        assert_eq!(events[0].tool_input.as_ref().unwrap()["command"], "ls");
    }

    #[test]
    fn test_insert_event_rejects_malformed() {
        let db = test_db();
        let event = SessionEvent::new("", EventType::Error, AgentType::Aider);
        assert!(matches!(db.insert_event(&event), Err(Error::InvalidRecord(_))));

        let mut event = SessionEvent::new("s", EventType::Error, AgentType::Aider);
        event.confidence = f64::NAN;
        assert!(db.insert_event(&event).is_err());
    }

    #[test]
    fn test_events_newest_first_and_filtered() {
        let db = test_db();
        let base = Utc::now() - Duration::minutes(30);
        for (i, event_type) in [
            EventType::PromptReceived,
            EventType::ToolStart,
            EventType::PromptReceived,
        ]
        .into_iter()
        .enumerate()
        {
            let event = SessionEvent::new("s1", event_type, AgentType::ClaudeCode)
                .at(base + Duration::minutes(i as i64));
            db.insert_event(&event).unwrap();
        }
        let old = SessionEvent::new("s2", EventType::PromptReceived, AgentType::Aider)
            .at(Utc::now() - Duration::hours(5));
        db.insert_event(&old).unwrap();

        let events = db.get_session_events("s1", &[], 10).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].timestamp > events[2].timestamp);

        let prompts = db
            .get_session_events("s1", &[EventType::PromptReceived], 10)
            .unwrap();
        assert_eq!(prompts.len(), 2);

        let recent = db.get_recent_events(60, &[], 100).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(db.count_events().unwrap(), 4);
    }

    #[test]
    fn test_dedup_sums_losers_into_survivor() {
        let db = test_db();
        let mut ids = vec![];
        for (messages, tokens) in [(100, 1000), (10, 50), (5, 20)] {
            let mut s = create_test_session("dup");
            s.message_count = messages;
            s.tokens_input = tokens;
            db.upsert_session(&s).unwrap();
            db.insert_event(&SessionEvent::new(&s.id, EventType::PromptReceived, AgentType::ClaudeCode))
                .unwrap();
            ids.push(s.id);
        }

        let report = db.deduplicate_sessions().unwrap();
        assert_eq!(report.duplicates_found, 2);
        assert_eq!(report.duplicates_removed, 2);
        assert_eq!(report.events_migrated, 2);

        let survivor = db.get_session(&ids[0]).unwrap().unwrap();
        assert_eq!(survivor.message_count, 115);
        assert_eq!(survivor.tokens_input, 1070);
        assert!(db.get_session(&ids[1]).unwrap().is_none());
        assert_eq!(db.get_session_events(&ids[0], &[], 10).unwrap().len(), 3);

        let again = db.deduplicate_sessions().unwrap();
        assert_eq!(again, DedupReport::default());
        let survivor = db.get_session(&ids[0]).unwrap().unwrap();
        assert_eq!(survivor.message_count, 115);
    }

    #[test]
    fn test_dedup_ignores_distinct_agent_types() {
        let db = test_db();
        db.upsert_session(&Session::new(AgentType::Aider, "same", "/r")).unwrap();
        db.upsert_session(&Session::new(AgentType::Cursor, "same", "/r")).unwrap();
        assert_eq!(db.deduplicate_sessions().unwrap().duplicates_found, 0);
    }

    #[test]
    fn test_stale_sweep_threshold() {
        let db = test_db();
        let mut stale = create_test_session("stale");
        stale.last_activity_at = Utc::now() - Duration::hours(25);
        stale.started_at = stale.last_activity_at - Duration::minutes(10);
        let mut fresh = create_test_session("fresh");
        fresh.last_activity_at = Utc::now() - Duration::hours(23);
        db.upsert_session(&stale).unwrap();
        db.upsert_session(&fresh).unwrap();

        assert_eq!(db.cleanup_stale_sessions(24, true).unwrap(), 1);

        let closed = db.get_session(&stale.id).unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Completed);
        assert_eq!(closed.ended_at, Some(closed.last_activity_at));
        assert_eq!(closed.duration_seconds, 600);

        let untouched = db.get_session(&fresh.id).unwrap().unwrap();
        assert_eq!(untouched.status, SessionStatus::Active);
        assert!(untouched.ended_at.is_none());
    }

    #[test]
    fn test_stale_sweep_delete_mode() {
        let db = test_db();
        let mut stale = create_test_session("stale");
        stale.last_activity_at = Utc::now() - Duration::hours(30);
        db.upsert_session(&stale).unwrap();
        db.insert_event(&SessionEvent::new(&stale.id, EventType::SessionStart, AgentType::ClaudeCode))
            .unwrap();

        assert_eq!(db.cleanup_stale_sessions(24, false).unwrap(), 1);
        assert!(db.get_session(&stale.id).unwrap().is_none());
        assert_eq!(db.count_events().unwrap(), 0);
    }

    #[test]
    fn test_summary_and_hourly_metrics() {
        let db = test_db();
        let mut a = create_test_session("a");
        a.message_count = 4;
        a.tokens_input = 100;
        a.estimated_cost = 0.5;
        a.model_id = Some("claude-sonnet-4-20250514".to_string());
        let mut b = Session::new(AgentType::Aider, "b", "/r");
        b.status = SessionStatus::Completed;
        b.message_count = 2;
        db.upsert_session(&a).unwrap();
        db.upsert_session(&b).unwrap();

        let summary = db.get_summary_metrics(None, 24).unwrap();
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.active_sessions, 1);
        assert_eq!(summary.completed_sessions, 1);
        assert_eq!(summary.total_messages, 6);
        assert_eq!(summary.model_usage["claude-sonnet-4-20250514"], 1);
        assert_eq!(summary.hourly_distribution.values().sum::<i64>(), 2);

        let claude = db.get_summary_metrics(Some(AgentType::ClaudeCode), 24).unwrap();
        assert_eq!(claude.total_sessions, 1);

        let first = db.update_hourly_metrics(AgentType::ClaudeCode, a.started_at).unwrap();
        let second = db.update_hourly_metrics(AgentType::ClaudeCode, a.started_at).unwrap();
        assert_eq!(first.session_count, 1);
        assert_eq!(first, second);

        let stored = db
            .get_hourly_metrics(Some(AgentType::ClaudeCode), Utc::now() - Duration::hours(2))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].tokens_input, 100);
    }
}
