//! agentmon - AI coding agent session monitor
//!
//! Runs the monitoring daemon, forwards tool hooks to it and answers
//! questions about recorded sessions straight from the database.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/agentmon/agentmon.db (~/.local/share/agentmon/agentmon.db)
//! - Logs: $XDG_STATE_HOME/agentmon/agentmon.log (~/.local/state/agentmon/agentmon.log)
//! - Socket: $XDG_STATE_HOME/agentmon/agentmon.sock
//! - Config: $XDG_CONFIG_HOME/agentmon/config.toml (~/.config/agentmon/config.toml)

mod format;
mod process_lock;
mod server;

use agentmon_core::adapters::install_hooks;
use agentmon_core::ipc::send_request;
use agentmon_core::logging::{self, LogTarget};
use agentmon_core::{
    AgentType, Config, Daemon, Database, EventType, Request, Session, SessionFilter,
};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::format::{
    format_cost, format_duration, format_relative_time, format_relative_time_opt, format_tokens,
    short_id, shorten_path, truncate,
};
use crate::process_lock::acquire_daemon_guard;
use crate::server::IpcServer;

/// Largest hook payload read from stdin
const MAX_HOOK_PAYLOAD: u64 = 1024 * 1024;

/// How long `hook` waits for the daemon
const HOOK_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `status` waits for the daemon
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "agentmon")]
#[command(about = "Monitor AI coding agent sessions")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/agentmon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring daemon until interrupted
    Daemon {
        /// Print startup and shutdown progress to stdout
        #[arg(short, long)]
        foreground: bool,
    },

    /// Forward a tool hook (JSON on stdin) to the daemon
    Hook {
        /// Hook event name (session_start, tool_start, ...)
        event: String,
    },

    /// Show daemon and database status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List sessions (active only by default)
    Sessions {
        /// Include sessions in every status
        #[arg(short, long)]
        all: bool,

        /// Only sessions with activity in the last N hours
        #[arg(long)]
        hours: Option<i64>,

        /// Filter by agent type
        #[arg(long)]
        agent: Option<AgentType>,

        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// List recent events
    Events {
        /// Events of one session (internal id)
        #[arg(short, long)]
        session: Option<String>,

        /// Window in minutes when no session is given
        #[arg(short, long, default_value = "60")]
        minutes: i64,

        /// Only these event types (repeatable)
        #[arg(short = 't', long = "type")]
        event_types: Vec<EventType>,

        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show usage totals
    Metrics {
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Restrict to one agent type
        #[arg(long)]
        agent: Option<AgentType>,

        #[arg(long)]
        json: bool,
    },

    /// Merge duplicate sessions
    Dedup,

    /// Close (or delete) sessions with no recent activity
    Cleanup {
        /// Inactivity threshold (default: daemon.stale_after_hours)
        #[arg(long)]
        hours: Option<i64>,

        /// Delete stale sessions and their events instead of completing them
        #[arg(long)]
        delete: bool,
    },

    /// Install agentmon hooks into the Claude Code settings
    InstallHooks,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    if let Command::Hook { event } = &args.command {
        run_hook(args.config.as_ref(), event);
        return Ok(());
    }

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Daemon { foreground } => cmd_daemon(config, foreground),
        Command::Hook { .. } => Ok(()),
        Command::Status { json } => cmd_status(&config, json),
        Command::Sessions {
            all,
            hours,
            agent,
            limit,
            json,
        } => cmd_sessions(all, hours, agent, limit, json),
        Command::Events {
            session,
            minutes,
            event_types,
            limit,
            json,
        } => cmd_events(session, minutes, &event_types, limit, json),
        Command::Metrics { hours, agent, json } => cmd_metrics(hours, agent, json),
        Command::Dedup => cmd_dedup(),
        Command::Cleanup { hours, delete } => {
            cmd_cleanup(hours.unwrap_or(config.daemon.stale_after_hours), delete)
        }
        Command::InstallHooks => cmd_install_hooks(&config),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

fn open_database() -> Result<Database> {
    let db_path = Config::database_path();
    Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))
}

// ============================================
// daemon
// ============================================

fn cmd_daemon(config: Config, foreground: bool) -> Result<()> {
    let target = if foreground {
        LogTarget::Foreground
    } else {
        LogTarget::Daemon
    };
    let _log_guard =
        logging::init(&config.logging, target).context("failed to initialize logging")?;

    tracing::info!("agentmon daemon starting");

    let db_path = Config::database_path();
    let _daemon_guard = acquire_daemon_guard(&db_path).context("failed to acquire daemon lock")?;

    tracing::info!(path = %db_path.display(), "Opening database");
    let db = open_database()?;

    if foreground {
        println!("Database: {}", db_path.display());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = runtime.block_on(run_daemon(config, Arc::new(db), foreground));

    tracing::info!("agentmon daemon exited");
    result
}

async fn run_daemon(config: Config, db: Arc<Database>, foreground: bool) -> Result<()> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .context("failed to set signal handler")?;

    let daemon = Arc::new(Daemon::start(config, db).await.context("failed to start daemon")?);

    let socket = daemon.socket_path();
    let server = match IpcServer::bind(&socket).await {
        Ok(server) => server,
        Err(e) => {
            daemon.stop().await;
            return Err(e);
        }
    };
    let server_task = tokio::spawn(server.run(Arc::clone(&daemon), stop_rx.clone()));

    if foreground {
        println!("Socket: {}", socket.display());
        for adapter in daemon.adapters() {
            println!("Adapter: {}", adapter.name());
        }
        println!("agentmon daemon running. Press Ctrl+C to stop.");
    }

    while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
            break;
        }
    }

    if foreground {
        println!("\nShutting down...");
    }
    tracing::info!("Shutdown requested");

    if let Err(e) = server_task.await {
        tracing::warn!(error = %e, "IPC server task failed");
    }
    daemon.stop().await;

    if foreground {
        println!("agentmon daemon stopped.");
    }
    Ok(())
}

// ============================================
// hook
// ============================================

/// Forward one hook to the daemon. Never prints and never fails: the
/// calling tool must not be disturbed by a missing daemon.
fn run_hook(config_path: Option<&PathBuf>, event: &str) {
    let config = load_config(config_path).unwrap_or_default();
    let _log_guard = logging::init(&config.logging, LogTarget::Hook);
    let socket = config.socket_path();

    let mut input = String::new();
    let _ = std::io::stdin()
        .take(MAX_HOOK_PAYLOAD)
        .read_to_string(&mut input);
    let data = parse_hook_payload(&input);

    let request = Request::HookEvent {
        event_type: event.to_string(),
        data,
        timestamp: Some(Utc::now()),
    };

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    else {
        return;
    };
    if let Err(e) = runtime.block_on(send_request(&socket, &request, HOOK_TIMEOUT)) {
        tracing::warn!(event = %event, socket = %socket.display(), error = %e, "Hook not delivered");
    }
}

/// Empty or unparsable input becomes an empty object
fn parse_hook_payload(input: &str) -> Value {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({}),
    }
}

// ============================================
// status
// ============================================

fn cmd_status(config: &Config, as_json: bool) -> Result<()> {
    let socket = config.socket_path();
    let daemon_status = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(send_request(&socket, &Request::GetStatus, STATUS_TIMEOUT))
        .ok()
        .filter(|r| r.ok);

    let db = open_database()?;
    let by_status = db.count_sessions_by_status()?;
    let total_events = db.count_events()?;

    if as_json {
        let output = json!({
            "daemon": daemon_status.as_ref().map(|r| Value::Object(r.payload.clone())),
            "socket_path": socket,
            "database_path": Config::database_path(),
            "sessions_by_status": by_status,
            "total_events": total_events,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("agentmon status");
    println!("===============");
    println!();
    match &daemon_status {
        Some(status) => {
            let state = status
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let uptime = status
                .get("uptime_seconds")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            println!("Daemon:          {} (up {})", state, format_duration(uptime));
            if let Some(adapters) = status.get("adapters").and_then(Value::as_array) {
                let names: Vec<&str> = adapters
                    .iter()
                    .filter_map(|a| a.get("name").and_then(Value::as_str))
                    .collect();
                println!("Adapters:        {}", names.join(", "));
            }
            if let Some(events) = status.get("events") {
                println!(
                    "Event queue:     {} pending, {} dropped, {} dispatched",
                    events["pending"], events["dropped"], events["dispatched"]
                );
                let last_event = events
                    .get("last_event_at")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                println!("Last event:      {}", format_relative_time_opt(last_event));
            }
        }
        None => println!("Daemon:          not running"),
    }
    println!("Socket:          {}", socket.display());
    println!("Database:        {}", Config::database_path().display());
    println!();

    let total: i64 = by_status.values().sum();
    println!("Sessions:        {}", total);
    for (status, count) in &by_status {
        println!("  {:<14} {}", status, count);
    }
    println!("Events:          {}", total_events);
    Ok(())
}

// ============================================
// queries
// ============================================

fn cmd_sessions(
    all: bool,
    hours: Option<i64>,
    agent: Option<AgentType>,
    limit: usize,
    as_json: bool,
) -> Result<()> {
    let db = open_database()?;
    let filter = SessionFilter {
        agent_types: agent.into_iter().collect(),
        status: if all || hours.is_some() {
            None
        } else {
            Some(agentmon_core::SessionStatus::Active)
        },
        active_since: hours.map(|h| Utc::now() - chrono::Duration::hours(h)),
        limit,
        ..Default::default()
    };
    let sessions = db.list_sessions(&filter).context("failed to list sessions")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<11}  {:<9}  {:<32}  {:>5}  {:>5}  {:>7}  {:>8}  {}",
        "ID", "AGENT", "STATUS", "PROJECT", "MSGS", "TOOLS", "TOKENS", "COST", "LAST ACTIVE"
    );
    for session in &sessions {
        print_session_row(session);
    }
    println!();
    println!("{} session(s)", sessions.len());
    Ok(())
}

fn print_session_row(session: &Session) {
    println!(
        "{:<8}  {:<11}  {:<9}  {:<32}  {:>5}  {:>5}  {:>7}  {:>8}  {}",
        short_id(&session.id),
        session.agent_type.as_str(),
        session.status.as_str(),
        truncate(&shorten_path(&session.project_path), 32),
        session.message_count,
        session.tool_call_count,
        format_tokens(session.tokens_input + session.tokens_output),
        format_cost(session.estimated_cost),
        format_relative_time(session.last_activity_at),
    );
}

fn cmd_events(
    session: Option<String>,
    minutes: i64,
    event_types: &[EventType],
    limit: usize,
    as_json: bool,
) -> Result<()> {
    let db = open_database()?;
    let events = match &session {
        Some(id) => db.get_session_events(id, event_types, limit),
        None => db.get_recent_events(minutes, event_types, limit),
    }
    .context("failed to query events")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    for event in &events {
        let detail = event
            .tool_name
            .clone()
            .or_else(|| event.file_path.as_deref().map(shorten_path))
            .or_else(|| event.content.clone())
            .unwrap_or_default();
        println!(
            "{:<9}  {:<8}  {:<20}  {}",
            format_relative_time(event.timestamp),
            short_id(&event.session_id),
            event.event_type.as_str(),
            truncate(&detail, 80),
        );
    }
    Ok(())
}

fn cmd_metrics(hours: i64, agent: Option<AgentType>, as_json: bool) -> Result<()> {
    let db = open_database()?;
    let summary = db
        .get_summary_metrics(agent, hours.max(1))
        .context("failed to compute metrics")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let scope = agent.map(|a| a.display_name()).unwrap_or("All agents");
    println!("{} - last {}h", scope, summary.hours);
    println!();
    println!(
        "Sessions:        {} ({} active, {} completed, {} crashed)",
        summary.total_sessions,
        summary.active_sessions,
        summary.completed_sessions,
        summary.crashed_sessions
    );
    println!("Messages:        {}", summary.total_messages);
    println!("Tool calls:      {}", summary.total_tool_calls);
    println!(
        "Tokens:          {} in / {} out",
        format_tokens(summary.total_tokens_input),
        format_tokens(summary.total_tokens_output)
    );
    println!("Cost:            {}", format_cost(summary.total_cost));
    println!(
        "Avg duration:    {}",
        format_duration(summary.avg_session_duration.round() as i64)
    );

    if !summary.model_usage.is_empty() {
        println!();
        println!("Models:");
        for (model, count) in &summary.model_usage {
            println!("  {:<32} {}", model, count);
        }
    }
    Ok(())
}

// ============================================
// maintenance
// ============================================

fn cmd_dedup() -> Result<()> {
    let db = open_database()?;
    let report = db
        .deduplicate_sessions()
        .context("failed to deduplicate sessions")?;

    println!("Deduplication complete:");
    println!("  Duplicates found:   {}", report.duplicates_found);
    println!("  Sessions removed:   {}", report.duplicates_removed);
    println!("  Events migrated:    {}", report.events_migrated);
    Ok(())
}

fn cmd_cleanup(hours: i64, delete: bool) -> Result<()> {
    let db = open_database()?;
    let affected = db
        .cleanup_stale_sessions(hours, !delete)
        .context("failed to clean up stale sessions")?;

    let action = if delete { "Deleted" } else { "Completed" };
    println!(
        "{} {} session(s) inactive for more than {}h",
        action, affected, hours
    );
    Ok(())
}

fn cmd_install_hooks(config: &Config) -> Result<()> {
    let home = config.claude_code.home_dir();
    let changed = install_hooks(&home)
        .with_context(|| format!("failed to install hooks into {}", home.display()))?;

    let settings = home.join("settings.json");
    if changed {
        println!("Hooks installed in {}", settings.display());
    } else {
        println!("Hooks already installed in {}", settings.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["agentmon", "sessions", "--all", "--agent", "aider"]).unwrap();
        match args.command {
            Command::Sessions { all, agent, limit, .. } => {
                assert!(all);
                assert_eq!(agent, Some(AgentType::Aider));
                assert_eq!(limit, 50);
            }
            _ => panic!("expected sessions"),
        }

        let args = Args::try_parse_from(["agentmon", "events", "-t", "tool_start", "-t", "file_read"]).unwrap();
        match args.command {
            Command::Events { event_types, minutes, .. } => {
                assert_eq!(event_types, vec![EventType::ToolStart, EventType::FileRead]);
                assert_eq!(minutes, 60);
            }
            _ => panic!("expected events"),
        }

        assert!(Args::try_parse_from(["agentmon", "hook"]).is_err());
        assert!(Args::try_parse_from(["agentmon", "metrics", "--agent", "vim"]).is_err());
    }

    #[test]
    fn test_hook_payload_parsing() {
        assert_eq!(parse_hook_payload(""), json!({}));
        assert_eq!(parse_hook_payload("  \n"), json!({}));
        assert_eq!(parse_hook_payload("not json"), json!({}));
        assert_eq!(parse_hook_payload("[1, 2]"), json!({}));
        assert_eq!(
            parse_hook_payload(r#"{"session_id": "abc"}"#),
            json!({"session_id": "abc"})
        );
    }
}
