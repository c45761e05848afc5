use agentmon_core::{AgentType, Database, Session, SessionStatus};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("data");
        let xdg_config = base.join("config");
        let xdg_state = base.join("state");
        let xdg_runtime = base.join("run");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("agentmon/agentmon.db")
    }

    fn socket_path(&self) -> PathBuf {
        self.xdg_state.join("agentmon/agentmon.sock")
    }

    fn claude_settings(&self) -> PathBuf {
        self.home.join(".claude/settings.json")
    }

    fn write_config(&self, contents: &str) {
        let path = self.xdg_config.join("agentmon/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config dir");
        fs::write(path, contents).expect("failed to write config");
    }

    fn open_db(&self) -> Database {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        db
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(PathBuf::from(assert_cmd::cargo::cargo_bin!("agentmon")));
        command
            .args(args)
            .env("HOME", &self.home)
            .env("XDG_DATA_HOME", &self.xdg_data)
            .env("XDG_CONFIG_HOME", &self.xdg_config)
            .env("XDG_STATE_HOME", &self.xdg_state)
            .env("XDG_RUNTIME_DIR", &self.xdg_runtime)
            .env_remove("RUST_LOG");
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args)
            .output()
            .unwrap_or_else(|e| panic!("failed to execute agentmon: {e}"))
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert_success(args, &output);
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let stdout = self.run_ok(args);
        serde_json::from_str(&stdout)
            .unwrap_or_else(|e| panic!("agentmon {args:?} printed invalid JSON ({e}):\n{stdout}"))
    }

    fn run_with_stdin(&self, args: &[&str], stdin: &str) -> Output {
        assert_cmd::Command::from_std(self.command(args))
            .write_stdin(stdin.to_string())
            .output()
            .unwrap_or_else(|e| panic!("failed to execute agentmon: {e}"))
    }
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "agentmon {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    condition()
}

/// Kills the daemon if a test fails before stopping it
struct DaemonProcess(Child);

impl DaemonProcess {
    fn terminate(&mut self) -> bool {
        let _ = Command::new("kill")
            .args(["-TERM", &self.0.id().to_string()])
            .status();
        wait_for(Duration::from_secs(15), || {
            matches!(self.0.try_wait(), Ok(Some(_)))
        })
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn session(external_id: &str, project: &str, status: SessionStatus) -> Session {
    let mut session = Session::new(AgentType::ClaudeCode, external_id, project);
    session.status = status;
    session
}

// ============================================
// Hook installation
// ============================================

#[test]
fn install_hooks_merges_settings_idempotently() {
    let env = CliTestEnv::new();
    let settings = env.claude_settings();
    fs::create_dir_all(settings.parent().unwrap()).unwrap();
    fs::write(&settings, r#"{"theme": "dark"}"#).unwrap();

    let first = env.run_ok(&["install-hooks"]);
    assert!(first.contains("Hooks installed"), "got:\n{first}");

    let contents = fs::read_to_string(&settings).unwrap();
    let parsed: Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(parsed["theme"], "dark");
    assert!(contents.contains("agentmon hook session_start"));
    assert!(contents.contains("agentmon hook tool_start"));

    let second = env.run_ok(&["install-hooks"]);
    assert!(second.contains("already installed"), "got:\n{second}");
    assert_eq!(fs::read_to_string(&settings).unwrap(), contents);
}

#[test]
fn install_hooks_refuses_corrupt_settings() {
    let env = CliTestEnv::new();
    let settings = env.claude_settings();
    fs::create_dir_all(settings.parent().unwrap()).unwrap();
    fs::write(&settings, "{ definitely not json").unwrap();

    let output = env.run(&["install-hooks"]);
    assert!(!output.status.success());
    assert_eq!(
        fs::read_to_string(&settings).unwrap(),
        "{ definitely not json"
    );
}

// ============================================
// Hook forwarding without a daemon
// ============================================

#[test]
fn hook_without_daemon_is_silent_and_succeeds() {
    let env = CliTestEnv::new();

    let output = env.run_with_stdin(
        &["hook", "tool_start"],
        r#"{"session_id": "abc", "tool_name": "Bash"}"#,
    );
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());

    let garbage = env.run_with_stdin(&["hook", "not_an_event"], "{{{");
    assert!(garbage.status.success());
    assert!(garbage.stdout.is_empty());
    assert!(garbage.stderr.is_empty());

    // The missed delivery is recorded in the hook's own log, not the daemon's
    let log_dir = env.xdg_state.join("agentmon");
    let logs: Vec<String> = fs::read_dir(&log_dir)
        .expect("hook log dir missing")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    let hook_log = logs
        .iter()
        .find(|name| name.starts_with("hook.log"))
        .expect("no hook log written");
    assert!(!logs.iter().any(|name| name.starts_with("agentmon.log")));
    let contents = fs::read_to_string(log_dir.join(hook_log)).unwrap();
    assert!(contents.contains("Hook not delivered"));
}

// ============================================
// Database queries
// ============================================

#[test]
fn status_without_daemon_reads_database() {
    let env = CliTestEnv::new();
    let db = env.open_db();
    db.upsert_session(&session("s-1", "/repo/a", SessionStatus::Active))
        .unwrap();
    db.upsert_session(&session("s-2", "/repo/b", SessionStatus::Completed))
        .unwrap();
    drop(db);

    let text = env.run_ok(&["status"]);
    assert!(text.contains("not running"), "got:\n{text}");

    let status = env.run_json(&["status", "--json"]);
    assert!(status["daemon"].is_null());
    assert_eq!(status["sessions_by_status"]["active"], 1);
    assert_eq!(status["sessions_by_status"]["completed"], 1);
    assert_eq!(status["total_events"], 0);
}

#[test]
fn sessions_and_metrics_read_seeded_database() {
    let env = CliTestEnv::new();
    let db = env.open_db();

    let mut active = session("active-1", "/repo/app", SessionStatus::Active);
    active.tokens_input = 1_000_000;
    active.tokens_output = 1_000_000;
    active.estimated_cost = 18.0;
    active.message_count = 4;
    db.upsert_session(&active).unwrap();
    db.upsert_session(&session("done-1", "/repo/lib", SessionStatus::Completed))
        .unwrap();
    drop(db);

    let sessions = env.run_json(&["sessions", "--json"]);
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["external_id"], "active-1");
    assert_eq!(sessions[0]["status"], "active");

    let all = env.run_json(&["sessions", "--all", "--json"]);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let aider_only = env.run_json(&["sessions", "--all", "--agent", "aider", "--json"]);
    assert!(aider_only.as_array().unwrap().is_empty());

    let table = env.run_ok(&["sessions"]);
    assert!(table.contains("claude_code"));
    assert!(table.contains("$18.00"));
    assert!(table.contains("1 session(s)"));

    let metrics = env.run_json(&["metrics", "--json"]);
    assert_eq!(metrics["total_sessions"], 2);
    assert_eq!(metrics["active_sessions"], 1);
    assert_eq!(metrics["total_messages"], 4);
    assert!((metrics["total_cost"].as_f64().unwrap() - 18.0).abs() < 1e-9);

    let text = env.run_ok(&["metrics", "--agent", "claude_code"]);
    assert!(text.contains("Sessions:        2"), "got:\n{text}");
}

#[test]
fn events_lists_stored_events() {
    let env = CliTestEnv::new();
    let db = env.open_db();
    let s = session("ev-1", "/repo/app", SessionStatus::Active);
    db.upsert_session(&s).unwrap();
    db.insert_event(
        &agentmon_core::SessionEvent::new(&s.id, agentmon_core::EventType::ToolStart, AgentType::ClaudeCode)
            .with_tool("Bash", None),
    )
    .unwrap();
    db.insert_event(
        &agentmon_core::SessionEvent::new(&s.id, agentmon_core::EventType::PromptReceived, AgentType::ClaudeCode)
            .with_content("fix the build"),
    )
    .unwrap();
    drop(db);

    let events = env.run_json(&["events", "--json"]);
    assert_eq!(events.as_array().unwrap().len(), 2);

    let tools = env.run_json(&["events", "--session", &s.id, "--type", "tool_start", "--json"]);
    let tools = tools.as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["tool_name"], "Bash");

    let text = env.run_ok(&["events"]);
    assert!(text.contains("prompt_received"));
    assert!(text.contains("fix the build"));
}

// ============================================
// Maintenance sweeps
// ============================================

#[test]
fn dedup_and_cleanup_sweep_the_database() {
    let env = CliTestEnv::new();
    let db = env.open_db();

    let mut older = session("dup", "/repo/app", SessionStatus::Active);
    older.started_at = Utc::now() - ChronoDuration::minutes(10);
    let newer = session("dup", "/repo/app", SessionStatus::Active);
    db.upsert_session(&older).unwrap();
    db.upsert_session(&newer).unwrap();

    let mut stale = session("stale", "/repo/old", SessionStatus::Active);
    stale.started_at = Utc::now() - ChronoDuration::hours(50);
    stale.last_activity_at = Utc::now() - ChronoDuration::hours(48);
    db.upsert_session(&stale).unwrap();
    drop(db);

    let dedup = env.run_ok(&["dedup"]);
    assert!(dedup.contains("Sessions removed:   1"), "got:\n{dedup}");

    let cleanup = env.run_ok(&["cleanup", "--hours", "24"]);
    assert!(cleanup.contains("Completed 1 session(s)"), "got:\n{cleanup}");

    let db = env.open_db();
    let stored = db.get_session(&stale.id).unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(db.count_sessions_by_status().unwrap().get("active"), Some(&1));
}

// ============================================
// Daemon end to end
// ============================================

#[test]
fn daemon_accepts_hooks_and_shuts_down_cleanly() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[daemon]
enabled_adapters = ["claude_code"]
poll_interval_secs = 1
discovery_interval_secs = 5
"#,
    );

    let child = env
        .command(&["daemon"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn daemon");
    let mut daemon = DaemonProcess(child);

    let socket = env.socket_path();
    assert!(
        wait_for(Duration::from_secs(20), || socket.exists()),
        "daemon never created {}",
        socket.display()
    );

    let second = env.run(&["daemon"]);
    assert!(!second.status.success(), "a second daemon must be refused");

    let hook = env.run_with_stdin(
        &["hook", "session_start"],
        r#"{"session_id": "e2e-1", "cwd": "/tmp/e2e-project", "source": "startup"}"#,
    );
    assert!(hook.status.success());

    let found = wait_for(Duration::from_secs(10), || {
        let sessions = env.run_json(&["sessions", "--json"]);
        sessions
            .as_array()
            .map(|list| list.iter().any(|s| s["external_id"] == "e2e-1"))
            .unwrap_or(false)
    });
    assert!(found, "hooked session never reached the database");

    let status = env.run_json(&["status", "--json"]);
    assert_eq!(status["daemon"]["state"], "running");
    assert_eq!(status["daemon"]["adapters"][0]["name"], "claude_code");

    assert!(daemon.terminate(), "daemon did not exit after SIGTERM");
    assert!(!socket.exists(), "socket should be removed on shutdown");
    assert!(!Path::new(&env.socket_path()).exists());
}
