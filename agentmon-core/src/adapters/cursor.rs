//! Cursor adapter
//!
//! Cursor exposes no transcript. Sessions come from the editor process
//! (workspace taken from `--folder-uri`), from the recently viewed files in
//! `ide_state.json` and from document opens in the newest `main.log`. Files
//! are attributed to a project by walking up to the nearest marker file.

use super::reconcile::{short_hash, AdapterContext, DeltaPolicy, Reconciler};
use super::SourceState;
use crate::config::{home_dir, CursorConfig};
use crate::error::Result;
use crate::ingest::decoders::{decode_file_uri, CursorLogDecoder};
use crate::ingest::{Decoder, Delta, DeltaKind, FileTail};
use crate::process::ProcessInfo;
use crate::types::{AdapterCapabilities, AgentType, Session, SessionStatus, UNKNOWN_PROJECT};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const AGENT: AgentType = AgentType::Cursor;

/// Log lines only hint at activity
const LOG_CONFIDENCE: f64 = 0.6;

/// Recent files kept in session metadata
const RECENT_FILES_KEPT: usize = 5;

pub fn capabilities() -> AdapterCapabilities {
    AdapterCapabilities {
        real_time_events: false,
        historical_data: false,
        token_tracking: false,
        cost_tracking: false,
        file_change_tracking: true,
        hook_integration: false,
        transcript_access: false,
    }
}

/// True for the editor's main process; helper processes are skipped
pub fn is_cursor_process(process: &ProcessInfo) -> bool {
    let name = process.name_lower();
    !process.is_agentmon() && name.contains("cursor") && !name.contains("helper")
}

/// Workspace folder from `--folder-uri`, percent-decoded
pub fn workspace_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(uri) = arg.strip_prefix("--folder-uri=") {
            return Some(decode_file_uri(uri));
        }
        if arg == "--folder-uri" {
            return iter.next().map(|uri| decode_file_uri(uri));
        }
    }
    None
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdeState {
    #[serde(default)]
    recently_viewed_files: Vec<ViewedFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewedFile {
    #[serde(default)]
    absolute_path: String,
}

pub struct CursorState {
    rec: Reconciler,
    config: CursorConfig,
    state_dir: PathBuf,
    tail: FileTail,
    decoder: CursorLogDecoder,
}

impl CursorState {
    pub fn new(config: CursorConfig, ctx: AdapterContext) -> Self {
        let state_dir = config.state_dir();
        Self {
            rec: Reconciler::new(AGENT, ctx),
            config,
            state_dir,
            tail: FileTail::new(),
            decoder: CursorLogDecoder::new(),
        }
    }

    fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// `ide_state.json` in the data directory, else under `~/.cursor`
    fn ide_state_path(&self) -> Option<PathBuf> {
        [
            self.state_dir.join("ide_state.json"),
            home_dir().join(".cursor").join("ide_state.json"),
        ]
        .into_iter()
        .find(|p| p.is_file())
    }

    /// `main.log` of the most recent log session
    fn newest_main_log(&self) -> Option<PathBuf> {
        let pattern = self.logs_dir().join("*").join("main.log");
        glob::glob(&pattern.to_string_lossy())
            .ok()?
            .filter_map(|p| p.ok())
            .max()
    }

    /// Nearest ancestor of `file` holding a project marker
    pub fn project_root(&self, file: &Path) -> Option<String> {
        let mut current = file.parent()?;
        for _ in 0..self.config.max_walk_depth {
            if self
                .config
                .project_markers
                .iter()
                .any(|marker| current.join(marker).exists())
            {
                return Some(current.to_string_lossy().into_owned());
            }
            current = current.parent()?;
        }
        None
    }

    fn process_candidates(&self, processes: &[ProcessInfo]) -> Vec<Session> {
        processes
            .iter()
            .filter(|p| is_cursor_process(p))
            .map(|p| {
                let workspace = workspace_from_args(&p.cmdline)
                    .or_else(|| p.cwd_string())
                    .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
                let mut session = Session::new(AGENT, format!("cursor_proc_{}", p.pid), workspace);
                session.pid = Some(p.pid);
                if let Some(started) = p.started_at() {
                    session.started_at = started;
                    session.recompute_duration();
                }
                session.set_meta("source", "process");
                session
            })
            .collect()
    }

    fn ide_state_candidates(&self) -> Vec<Session> {
        let Some(path) = self.ide_state_path() else {
            return Vec::new();
        };
        let state: IdeState = match std::fs::read_to_string(&path)
            .map_err(crate::error::Error::from)
            .and_then(|content| serde_json::from_str(&content).map_err(Into::into))
        {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read Cursor IDE state");
                return Vec::new();
            }
        };

        let mut projects: Vec<(String, Vec<String>)> = Vec::new();
        for file in state.recently_viewed_files {
            if file.absolute_path.is_empty() {
                continue;
            }
            let Some(root) = self.project_root(Path::new(&file.absolute_path)) else {
                continue;
            };
            match projects.iter_mut().find(|(p, _)| *p == root) {
                Some((_, files)) => files.push(file.absolute_path),
                None => projects.push((root, vec![file.absolute_path])),
            }
        }

        projects
            .into_iter()
            .map(|(project, files)| {
                let mut session =
                    Session::new(AGENT, format!("cursor_{}", short_hash(&project)), project);
                session.status = SessionStatus::Idle;
                session.set_meta("source", "ide_state");
                session.set_meta(
                    "recent_files",
                    files.into_iter().take(RECENT_FILES_KEPT).collect::<Vec<_>>(),
                );
                session
            })
            .collect()
    }

    /// Attribute newly logged document opens to their projects
    fn process_log(&mut self, path: &Path) {
        let lines = match self.tail.read_new_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Cursor log read failed");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }

        let mut by_project: Vec<(String, Vec<Delta>)> = Vec::new();
        for delta in self.decoder.decode(&lines) {
            let DeltaKind::FileTouched { path: file, .. } = &delta.kind else {
                continue;
            };
            let Some(root) = self.project_root(Path::new(file)) else {
                continue;
            };
            match by_project.iter_mut().find(|(p, _)| *p == root) {
                Some((_, deltas)) => deltas.push(delta),
                None => by_project.push((root, vec![delta])),
            }
        }

        let policy = DeltaPolicy {
            confidence: LOG_CONFIDENCE,
            ..Default::default()
        };
        for (project, deltas) in by_project {
            let result = match self.rec.cache().id_for_project(&project) {
                Some(id) => Ok(id),
                None => {
                    let mut candidate =
                        Session::new(AGENT, format!("cursor_{}", short_hash(&project)), project.clone());
                    candidate.set_meta("source", "main_log");
                    self.rec.find_or_merge(candidate).map(|(id, _)| id)
                }
            }
            .and_then(|id| self.rec.apply_deltas(&id, &deltas, policy));
            if let Err(e) = result {
                tracing::warn!(agent = %AGENT, project = %project, error = %e, "Failed to apply Cursor log");
            }
        }
    }
}

impl SourceState for CursorState {
    fn reconciler(&mut self) -> &mut Reconciler {
        &mut self.rec
    }

    fn discover_with(&mut self, processes: &[ProcessInfo]) -> Result<Vec<Session>> {
        let mut candidates = self.process_candidates(processes);
        candidates.extend(self.ide_state_candidates());
        Ok(self.rec.reconcile_candidates(candidates))
    }

    fn prime(&mut self) {
        if let Some(log) = self.newest_main_log() {
            if let Err(e) = self.tail.seek_to_end(&log) {
                tracing::debug!(path = %log.display(), error = %e, "Cannot prime tail offset");
            }
        }
    }

    fn watch_targets(&self) -> Vec<(PathBuf, bool)> {
        vec![(self.logs_dir(), true)]
    }

    fn poll(&mut self) {
        if let Some(log) = self.newest_main_log() {
            self.process_log(&log);
        }
    }

    fn on_change(&mut self, path: &Path) {
        if path.file_name().map(|n| n == "main.log").unwrap_or(false) {
            self.poll();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::db::Database;
    use crate::pricing::PricingTable;
    use crate::process::StaticProcesses;
    use crate::types::EventType;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn state(dir: &Path) -> (CursorState, AdapterContext) {
        let ctx = AdapterContext {
            db: Arc::new(Database::open_in_memory().unwrap()),
            bus: Arc::new(EventBus::new(1000)),
            pricing: Arc::new(PricingTable::default()),
            processes: Arc::new(StaticProcesses::default()),
        };
        let config = CursorConfig {
            state_dir: Some(dir.join("cursor")),
            ..Default::default()
        };
        (CursorState::new(config, ctx.clone()), ctx)
    }

    /// `<dir>/work/app` with a `.git` marker and a source file
    fn project(dir: &Path) -> (PathBuf, PathBuf) {
        let root = dir.join("work").join("app");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        let file = root.join("src").join("main.ts");
        std::fs::write(&file, "").unwrap();
        (root, file)
    }

    fn process(pid: u32, name: &str, cmd: &[&str]) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.to_string(),
            cmdline: cmd.iter().map(|s| s.to_string()).collect(),
            cwd: Some(PathBuf::from("/home/me")),
            start_time: 0,
        }
    }

    #[test]
    fn test_process_detection_and_workspace() {
        assert!(is_cursor_process(&process(1, "Cursor", &[])));
        assert!(!is_cursor_process(&process(2, "Cursor Helper (Renderer)", &[])));
        assert!(!is_cursor_process(&process(3, "code", &[])));

        let args: Vec<String> = ["cursor", "--folder-uri", "file:///srv/my%20app"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(workspace_from_args(&args).as_deref(), Some("/srv/my app"));
        assert_eq!(workspace_from_args(&args[..1]), None);
    }

    #[test]
    fn test_project_root_walk() {
        let dir = TempDir::new().unwrap();
        let (root, file) = project(dir.path());
        let (state, _ctx) = state(dir.path());
        assert_eq!(state.project_root(&file), Some(root.to_string_lossy().into_owned()));
        assert_eq!(state.project_root(Path::new("/definitely/not/a/project/x.rs")), None);
    }

    #[test]
    fn test_discovery_from_processes_and_ide_state() {
        let dir = TempDir::new().unwrap();
        let (root, file) = project(dir.path());
        let cursor_dir = dir.path().join("cursor");
        std::fs::create_dir_all(&cursor_dir).unwrap();
        std::fs::write(
            cursor_dir.join("ide_state.json"),
            serde_json::json!({
                "recentlyViewedFiles": [
                    {"absolutePath": file.to_string_lossy()},
                    {"absolutePath": ""},
                    {"relativePath": "orphan.rs"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let (mut state, _ctx) = state(dir.path());
        let sessions = state
            .discover_with(&[
                process(10, "Cursor", &["cursor", "--folder-uri", "file:///srv/api"]),
                process(11, "Cursor Helper", &[]),
            ])
            .unwrap();
        assert_eq!(sessions.len(), 2);

        let proc_session = sessions.iter().find(|s| s.external_id == "cursor_proc_10").unwrap();
        assert_eq!(proc_session.project_path, "/srv/api");

        let project = root.to_string_lossy().into_owned();
        let ide = sessions.iter().find(|s| s.project_path == project).unwrap();
        assert_eq!(ide.external_id, format!("cursor_{}", short_hash(&project)));
        assert_eq!(ide.status, SessionStatus::Idle);
        assert_eq!(ide.metadata["recent_files"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_newest_main_log_is_tailed() {
        let dir = TempDir::new().unwrap();
        let (root, file) = project(dir.path());
        let logs = dir.path().join("cursor").join("logs");
        let older = logs.join("20250101T000000");
        let newer = logs.join("20250102T000000");
        std::fs::create_dir_all(&older).unwrap();
        std::fs::create_dir_all(&newer).unwrap();
        std::fs::write(older.join("main.log"), "").unwrap();
        std::fs::write(newer.join("main.log"), "[info] openTextDocument file:///ignored/before/start.rs\n").unwrap();

        let (mut state, ctx) = state(dir.path());
        state.prime();

        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(newer.join("main.log"))
            .unwrap();
        writeln!(log, "2025-01-02 10:00:00.000 [info] openTextDocument file://{}", file.display()).unwrap();
        writeln!(log, "[info] openTextDocument file:///no/marker/here.rs").unwrap();
        drop(log);

        state.on_change(&newer.join("main.log"));

        let project = root.to_string_lossy().into_owned();
        let session = ctx.db.get_sessions_by_project(&project, 10).unwrap().pop().unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let reads = ctx.db.get_session_events(&session.id, &[EventType::FileRead], 10).unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].file_path.as_deref(), Some(file.to_string_lossy().as_ref()));
        assert!((reads[0].confidence - LOG_CONFIDENCE).abs() < 1e-9);
    }
}
