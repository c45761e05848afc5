//! Aider adapter
//!
//! Aider has no global state directory. Running instances are found in the
//! process table; past and ongoing work is found through the
//! `.aider.chat.history.md` file it appends to in each project root.

use super::reconcile::{short_hash, AdapterContext, DeltaPolicy, Reconciler};
use super::SourceState;
use crate::config::AiderConfig;
use crate::error::Result;
use crate::ingest::decoders::AiderDecoder;
use crate::ingest::{Decoder, FileTail};
use crate::process::ProcessInfo;
use crate::types::{AdapterCapabilities, AgentType, Session, SessionStatus, UNKNOWN_PROJECT};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const AGENT: AgentType = AgentType::Aider;

const HISTORY_FILE: &str = ".aider.chat.history.md";

/// Parsed from a markdown file, so less certain than a structured transcript
const CONFIDENCE: f64 = 0.8;

pub fn capabilities() -> AdapterCapabilities {
    AdapterCapabilities {
        real_time_events: false,
        historical_data: true,
        token_tracking: true,
        cost_tracking: true,
        file_change_tracking: false,
        hook_integration: false,
        transcript_access: true,
    }
}

/// True for an aider process other than this daemon
pub fn is_aider_process(process: &ProcessInfo) -> bool {
    !process.is_agentmon() && process.cmdline_string().to_lowercase().contains("aider")
}

/// Model from `--model X`, `-m X` or `--model=X`
pub fn model_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(model) = arg.strip_prefix("--model=") {
            if !model.is_empty() {
                return Some(model.to_string());
            }
        } else if arg == "--model" || arg == "-m" {
            return iter.next().cloned();
        }
    }
    None
}

pub struct AiderState {
    rec: Reconciler,
    config: AiderConfig,
    tail: FileTail,
    /// History files seen by the last scan
    history_files: BTreeSet<PathBuf>,
}

impl AiderState {
    pub fn new(config: AiderConfig, ctx: AdapterContext) -> Self {
        Self {
            rec: Reconciler::new(AGENT, ctx),
            config,
            tail: FileTail::new(),
            history_files: BTreeSet::new(),
        }
    }

    fn policy(&self) -> DeltaPolicy {
        DeltaPolicy {
            confidence: CONFIDENCE,
            cost_policy: self.config.cost_policy,
        }
    }

    /// Find history files under every search dir, `max_depth` levels deep
    fn scan_history_files(&self) -> BTreeSet<PathBuf> {
        let mut found = BTreeSet::new();
        for root in self.config.search_dirs.iter().filter(|d| d.is_dir()) {
            for depth in 0..=self.config.max_depth {
                let mut pattern = root.clone();
                for _ in 0..depth {
                    pattern.push("*");
                }
                pattern.push(HISTORY_FILE);
                let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
                    continue;
                };
                found.extend(paths.filter_map(|p| p.ok()));
            }
        }
        found
    }

    fn process_candidates(&self, processes: &[ProcessInfo]) -> Vec<Session> {
        processes
            .iter()
            .filter(|p| is_aider_process(p))
            .map(|p| {
                let cwd = p.cwd_string().unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
                let mut session = Session::new(AGENT, format!("aider_proc_{}", p.pid), cwd);
                session.pid = Some(p.pid);
                session.model_id = model_from_args(&p.cmdline);
                if let Some(started) = p.started_at() {
                    session.started_at = started;
                    session.recompute_duration();
                }
                session.set_meta("source", "process");
                session
            })
            .collect()
    }

    fn history_candidates(&self) -> Vec<Session> {
        self.history_files
            .iter()
            .filter_map(|path| {
                let project = project_of(path)?;
                let mut session = Session::new(
                    AGENT,
                    format!("aider_history_{}", short_hash(&project)),
                    project,
                );
                session.status = SessionStatus::Idle;
                if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
                    session.last_activity_at = modified.into();
                    session.started_at = session.started_at.min(session.last_activity_at);
                    session.recompute_duration();
                }
                session.set_meta("source", "history_file");
                session.set_meta("history_path", path.to_string_lossy().into_owned());
                Some(session)
            })
            .collect()
    }

    /// Apply newly appended history lines to the project's session
    fn process_history_file(&mut self, path: &Path) {
        let lines = match self.tail.read_new_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Aider history read failed");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }
        let Some(project) = project_of(path) else {
            return;
        };
        let deltas = AiderDecoder::new().decode(&lines);
        if deltas.is_empty() {
            return;
        }

        let policy = self.policy();
        let result = match self.rec.cache().id_for_project(&project) {
            Some(id) => Ok(id),
            None => {
                let mut candidate = Session::new(
                    AGENT,
                    format!("aider_history_{}", short_hash(&project)),
                    project.clone(),
                );
                candidate.set_meta("source", "history_file");
                self.rec.find_or_merge(candidate).map(|(id, _)| id)
            }
        }
        .and_then(|id| self.rec.apply_deltas(&id, &deltas, policy));

        match result {
            Ok(n) => tracing::debug!(agent = %AGENT, project = %project, events = n, "Applied aider history"),
            Err(e) => tracing::warn!(agent = %AGENT, project = %project, error = %e, "Failed to apply aider history"),
        }
    }
}

/// Project root of a history file
fn project_of(path: &Path) -> Option<String> {
    path.parent().map(|p| p.to_string_lossy().into_owned())
}

impl SourceState for AiderState {
    fn reconciler(&mut self) -> &mut Reconciler {
        &mut self.rec
    }

    fn discover_with(&mut self, processes: &[ProcessInfo]) -> Result<Vec<Session>> {
        self.history_files = self.scan_history_files();
        let mut candidates = self.process_candidates(processes);
        candidates.extend(self.history_candidates());
        Ok(self.rec.reconcile_candidates(candidates))
    }

    fn prime(&mut self) {
        self.history_files = self.scan_history_files();
        for path in &self.history_files {
            if let Err(e) = self.tail.seek_to_end(path) {
                tracing::debug!(path = %path.display(), error = %e, "Cannot prime tail offset");
            }
        }
    }

    fn watch_targets(&self) -> Vec<(PathBuf, bool)> {
        self.history_files.iter().map(|p| (p.clone(), false)).collect()
    }

    fn poll(&mut self) {
        let files: Vec<PathBuf> = self.history_files.iter().cloned().collect();
        for path in files {
            self.process_history_file(&path);
        }
    }

    fn on_change(&mut self, path: &Path) {
        if self.history_files.contains(path) {
            self.process_history_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::CostPolicy;
    use crate::db::Database;
    use crate::pricing::PricingTable;
    use crate::process::StaticProcesses;
    use crate::types::EventType;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn state(root: &Path, cost_policy: CostPolicy) -> (AiderState, AdapterContext) {
        let ctx = AdapterContext {
            db: Arc::new(Database::open_in_memory().unwrap()),
            bus: Arc::new(EventBus::new(1000)),
            pricing: Arc::new(PricingTable::default()),
            processes: Arc::new(StaticProcesses::default()),
        };
        let config = AiderConfig {
            search_dirs: vec![root.to_path_buf()],
            max_depth: 2,
            cost_policy,
        };
        (AiderState::new(config, ctx.clone()), ctx)
    }

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_model_from_args() {
        assert_eq!(model_from_args(&args(&["aider", "--model", "gpt-4o"])).as_deref(), Some("gpt-4o"));
        assert_eq!(model_from_args(&args(&["aider", "-m", "sonnet"])).as_deref(), Some("sonnet"));
        assert_eq!(model_from_args(&args(&["aider", "--model=o1"])).as_deref(), Some("o1"));
        assert_eq!(model_from_args(&args(&["aider", "--yes"])), None);
    }

    #[test]
    fn test_discovers_processes_and_history_files() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("team").join("api");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join(HISTORY_FILE), "#### hello\n").unwrap();
        // Too deep to be found
        let deep = dir.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join(HISTORY_FILE), "").unwrap();

        let (mut state, _ctx) = state(dir.path(), CostPolicy::Sum);
        let procs = vec![ProcessInfo {
            pid: 77,
            name: "python3".into(),
            cmdline: args(&["python3", "-m", "aider", "--model", "gpt-4o"]),
            cwd: Some(PathBuf::from("/elsewhere")),
            start_time: 0,
        }];
        let sessions = state.discover_with(&procs).unwrap();
        assert_eq!(sessions.len(), 2);

        let proc_session = sessions.iter().find(|s| s.external_id == "aider_proc_77").unwrap();
        assert_eq!(proc_session.model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(proc_session.status, SessionStatus::Active);

        let history = sessions
            .iter()
            .find(|s| s.external_id.starts_with("aider_history_"))
            .unwrap();
        assert_eq!(history.project_path, project.to_string_lossy());
        assert_eq!(history.status, SessionStatus::Idle);
    }

    #[test]
    fn test_tailing_applies_usage_with_latest_cost() {
        let dir = TempDir::new().unwrap();
        let history_path = dir.path().join(HISTORY_FILE);
        std::fs::write(&history_path, "#### old prompt\n").unwrap();

        let (mut state, ctx) = state(dir.path(), CostPolicy::Latest);
        state.prime();
        state.discover_with(&[]).unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&history_path).unwrap();
        writeln!(file, "#### add a flag").unwrap();
        writeln!(file, "> Tokens: 1k sent, 200 received. Cost: $0.01 message, $0.05 session.").unwrap();
        writeln!(file, "#### and tests").unwrap();
        writeln!(file, "> Tokens: 2k sent, 100 received. Cost: $0.02 message, $0.07 session.").unwrap();
        drop(file);

        state.on_change(&history_path);

        let project = dir.path().to_string_lossy().into_owned();
        let session = ctx
            .db
            .get_session_by_external_id(AGENT, &format!("aider_history_{}", short_hash(&project)))
            .unwrap()
            .unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.tokens_input, 3000);
        assert_eq!(session.tokens_output, 300);
        assert!((session.estimated_cost - 0.07).abs() < 1e-9);
        assert_eq!(session.status, SessionStatus::Active);

        let events = ctx.db.get_session_events(&session.id, &[EventType::CostEstimate], 10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| (e.confidence - CONFIDENCE).abs() < 1e-9));
    }

    #[test]
    fn test_sum_cost_policy() {
        let dir = TempDir::new().unwrap();
        let history_path = dir.path().join(HISTORY_FILE);
        std::fs::write(
            &history_path,
            "#### one\n> Cost: $0.25 message, $0.25 session.\n#### two\n> Cost: $0.50 message, $0.75 session.\n",
        )
        .unwrap();

        let (mut state, ctx) = state(dir.path(), CostPolicy::Sum);
        state.discover_with(&[]).unwrap();
        state.poll();

        let project = dir.path().to_string_lossy().into_owned();
        let session = ctx
            .db
            .get_sessions_by_project(&project, 10)
            .unwrap()
            .pop()
            .unwrap();
        assert!((session.estimated_cost - 0.75).abs() < 1e-9);
        assert_eq!(session.message_count, 2);
    }
}
