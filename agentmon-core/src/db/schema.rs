//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Migrations are additive only.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: sessions and their events
    r#"
    -- ============================================
    -- Sessions
    -- ============================================

    -- (agent_type, external_id) is the natural key. It is indexed but not
    -- UNIQUE: concurrent detection paths may briefly create duplicates that
    -- the dedup sweep later folds together.
    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        agent_type       TEXT NOT NULL,
        external_id      TEXT NOT NULL,
        project_path     TEXT NOT NULL DEFAULT '/',
        status           TEXT NOT NULL,
        started_at       TEXT NOT NULL,
        last_activity_at TEXT NOT NULL,
        ended_at         TEXT,
        duration_seconds INTEGER NOT NULL DEFAULT 0,

        -- Counters (monotonic outside dedup)
        message_count    INTEGER NOT NULL DEFAULT 0,
        tool_call_count  INTEGER NOT NULL DEFAULT 0,
        file_operations  INTEGER NOT NULL DEFAULT 0,
        tokens_input     INTEGER NOT NULL DEFAULT 0,
        tokens_output    INTEGER NOT NULL DEFAULT 0,
        estimated_cost   REAL NOT NULL DEFAULT 0,

        model_id         TEXT,
        pid              INTEGER,
        current_task     TEXT,
        progress         REAL,

        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL,
        metadata         JSON NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_external ON sessions(agent_type, external_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, last_activity_at);
    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_path);
    CREATE INDEX IF NOT EXISTS idx_sessions_pid ON sessions(pid);
    CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);

    -- ============================================
    -- Events (append-only)
    -- ============================================

    -- session_id deliberately has no REFERENCES clause: events may arrive
    -- before their session row, and dedup re-parents rather than deletes.
    CREATE TABLE IF NOT EXISTS session_events (
        id                TEXT PRIMARY KEY,
        session_id        TEXT NOT NULL,
        event_type        TEXT NOT NULL,
        timestamp         TEXT NOT NULL,
        agent_type        TEXT NOT NULL,
        content           TEXT,

        tool_name         TEXT,
        tool_input        JSON,
        tool_output       JSON,
        tool_duration_ms  INTEGER,
        tool_success      INTEGER,

        file_path         TEXT,
        file_operation    TEXT,

        tokens_input      INTEGER,
        tokens_output     INTEGER,
        estimated_cost    REAL,
        model_used        TEXT,

        parent_session_id TEXT,
        subagent_task     TEXT,

        error_type        TEXT,
        error_message     TEXT,

        confidence        REAL NOT NULL DEFAULT 1.0,
        metadata          JSON NOT NULL DEFAULT '{}',
        raw_data          JSON
    );

    CREATE INDEX IF NOT EXISTS idx_events_session ON session_events(session_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON session_events(timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_type ON session_events(event_type);
    "#,
    // Version 2: hourly rollups
    r#"
    -- ============================================
    -- Derived (regenerable)
    -- ============================================

    CREATE TABLE IF NOT EXISTS hourly_metrics (
        agent_type          TEXT NOT NULL,
        hour_start          TEXT NOT NULL,
        session_count       INTEGER NOT NULL DEFAULT 0,
        active_sessions     INTEGER NOT NULL DEFAULT 0,
        message_count       INTEGER NOT NULL DEFAULT 0,
        tool_call_count     INTEGER NOT NULL DEFAULT 0,
        file_operations     INTEGER NOT NULL DEFAULT 0,
        tokens_input        INTEGER NOT NULL DEFAULT 0,
        tokens_output       INTEGER NOT NULL DEFAULT 0,
        estimated_cost      REAL NOT NULL DEFAULT 0,
        model_usage         JSON NOT NULL DEFAULT '{}',
        hourly_distribution JSON NOT NULL DEFAULT '{}',
        computed_at         TEXT NOT NULL,

        PRIMARY KEY (agent_type, hour_start)
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["sessions", "session_events", "hourly_metrics"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_events_have_no_foreign_key() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&conn).unwrap();

        let fk_count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_foreign_key_list('session_events')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fk_count, 0);
    }
}
