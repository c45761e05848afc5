//! Claude Code adapter
//!
//! Claude Code keeps its state under `~/.claude/`:
//!
//! ```text
//! ~/.claude/
//! ├── history.jsonl              # one line per prompt, all projects
//! ├── stats-cache.json           # usage snapshot keyed by project path
//! ├── settings.json              # hook registration (see hooks module)
//! └── projects/
//!     └── -home-me-app/
//!         └── <session-uuid>.jsonl   # conversation transcript
//! ```
//!
//! Transcripts are the authoritative source of counters for the sessions
//! they describe. History lines and hook notifications for those sessions
//! still produce events, but do not bump counters a second time.

use super::reconcile::{short_hash, AdapterContext, DeltaPolicy, Reconciler};
use super::SourceState;
use crate::config::ClaudeCodeConfig;
use crate::error::Result;
use crate::ingest::decoders::{
    parse_stats_cache, HistoryDecoder, HistoryEntry, ProjectStats, TokenTotals, TranscriptDecoder,
};
use crate::ingest::{read_last_lines, Decoder, Delta, FileTail};
use crate::process::ProcessInfo;
use crate::types::{AdapterCapabilities, AgentType, Session, SessionStatus, UNKNOWN_PROJECT};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const AGENT: AgentType = AgentType::ClaudeCode;

pub fn capabilities() -> AdapterCapabilities {
    AdapterCapabilities {
        real_time_events: true,
        historical_data: true,
        token_tracking: true,
        cost_tracking: true,
        file_change_tracking: true,
        hook_integration: true,
        transcript_access: true,
    }
}

/// True for a Claude Code CLI process with a known working directory
pub fn is_claude_process(process: &ProcessInfo) -> bool {
    if process.is_agentmon() || process.cwd_string().is_none() {
        return false;
    }
    process.name_lower().contains("claude")
        || process.cmdline_string().contains("@anthropic-ai/claude-code")
}

pub struct ClaudeState {
    pub(super) rec: Reconciler,
    config: ClaudeCodeConfig,
    home: PathBuf,
    tail: FileTail,
    decoders: HashMap<PathBuf, TranscriptDecoder>,
    /// External ids whose transcript is being tailed
    pub(super) transcript_sessions: HashSet<String>,
    stats_mtime: Option<SystemTime>,
}

impl ClaudeState {
    pub fn new(config: ClaudeCodeConfig, ctx: AdapterContext) -> Self {
        let home = config.home_dir();
        Self {
            rec: Reconciler::new(AGENT, ctx),
            config,
            home,
            tail: FileTail::new(),
            decoders: HashMap::new(),
            transcript_sessions: HashSet::new(),
            stats_mtime: None,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn history_path(&self) -> PathBuf {
        self.home.join("history.jsonl")
    }

    fn stats_path(&self) -> PathBuf {
        self.home.join("stats-cache.json")
    }

    fn projects_dir(&self) -> PathBuf {
        self.home.join("projects")
    }

    fn transcript_files(&self) -> Vec<PathBuf> {
        let pattern = self.projects_dir().join("*").join("*.jsonl");
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
            Err(e) => {
                tracing::debug!(error = %e, "Invalid transcript glob");
                Vec::new()
            }
        }
    }

    // ----------------------------------------
    // Discovery
    // ----------------------------------------

    fn process_candidates(&self, processes: &[ProcessInfo]) -> Vec<Session> {
        processes
            .iter()
            .filter(|p| is_claude_process(p))
            .map(|p| {
                let cwd = p.cwd_string().unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
                let mut session = Session::new(AGENT, format!("proc_{}", p.pid), cwd);
                session.pid = Some(p.pid);
                if let Some(started) = p.started_at() {
                    session.started_at = started;
                    session.recompute_duration();
                }
                session.set_meta("source", "process");
                session.set_meta("cmdline", p.cmdline.clone());
                session
            })
            .collect()
    }

    fn history_candidates(&self) -> Vec<Session> {
        let path = self.history_path();
        if !path.exists() {
            return Vec::new();
        }
        let lines = match read_last_lines(&path, self.config.history_tail_lines) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(agent = %AGENT, error = %e, "Failed to read history");
                return Vec::new();
            }
        };

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<HistoryEntry>> = HashMap::new();
        for entry in lines.iter().filter_map(|l| HistoryEntry::parse(l)) {
            if !groups.contains_key(&entry.project) {
                order.push(entry.project.clone());
            }
            groups.entry(entry.project.clone()).or_default().push(entry);
        }

        let window = ChronoDuration::minutes(self.config.active_window_minutes);
        let now = Utc::now();
        order
            .into_iter()
            .filter_map(|project| {
                let entries = groups.remove(&project)?;
                let first = entries.first()?;
                let last = entries.last()?;
                let external_id = first
                    .session_id
                    .clone()
                    .unwrap_or_else(|| format!("history_{}", short_hash(&project)));

                let mut session = Session::new(AGENT, external_id, project.clone());
                session.message_count = entries.len() as i64;
                if let Some(ts) = first.timestamp {
                    session.started_at = ts;
                }
                if let Some(ts) = last.timestamp {
                    session.last_activity_at = ts.max(session.started_at);
                }
                let recent = last.timestamp.map(|ts| now - ts < window).unwrap_or(false);
                if recent {
                    session.status = SessionStatus::Active;
                } else {
                    session.status = SessionStatus::Completed;
                    session.ended_at = Some(session.last_activity_at);
                }
                session.recompute_duration();
                session.set_meta("source", "history");
                session.set_meta(
                    "first_message",
                    first.display.chars().take(100).collect::<String>(),
                );
                Some(session)
            })
            .collect()
    }

    // ----------------------------------------
    // Stats snapshot
    // ----------------------------------------

    /// Apply `stats-cache.json` if it changed since the last read
    pub fn load_stats(&mut self) -> Result<usize> {
        let path = self.stats_path();
        let Ok(meta) = std::fs::metadata(&path) else {
            return Ok(0);
        };
        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == self.stats_mtime {
            return Ok(0);
        }

        let content = std::fs::read_to_string(&path)?;
        let stats = parse_stats_cache(&content)?;
        self.stats_mtime = mtime;

        let mut applied = 0;
        for project in stats {
            let id = match self.rec.cache().id_for_project(&project.project_path) {
                Some(id) => id,
                None => {
                    let external_id = project
                        .last_session_id
                        .clone()
                        .unwrap_or_else(|| format!("stats_{}", short_hash(&project.project_path)));
                    let mut candidate =
                        Session::new(AGENT, external_id, project.project_path.clone());
                    candidate.status = SessionStatus::Idle;
                    candidate.set_meta("source", "stats_cache");
                    self.rec.find_or_merge(candidate)?.0
                }
            };
            let share = self.config.combined_token_input_share;
            self.rec.update(&id, |s| apply_stats(s, &project, share))?;
            applied += 1;
        }
        tracing::debug!(agent = %AGENT, projects = applied, "Applied stats snapshot");
        Ok(applied)
    }

    // ----------------------------------------
    // Tailing
    // ----------------------------------------

    fn process_transcript(&mut self, path: &Path) {
        let lines = match self.tail.read_new_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Transcript read failed");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let deltas = self
            .decoders
            .entry(path.to_path_buf())
            .or_insert_with(|| TranscriptDecoder::for_session(stem.clone()))
            .decode(&lines);

        for (external_id, group) in group_by_session(deltas, &stem) {
            let cwd = group
                .iter()
                .find_map(|d| d.cwd.clone())
                .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
            let mut candidate = Session::new(AGENT, external_id.clone(), cwd);
            candidate.set_meta("source", "transcript");
            candidate.set_meta("transcript_path", path.to_string_lossy().into_owned());

            self.transcript_sessions.insert(external_id.clone());
            let result = self
                .rec
                .find_or_merge(candidate)
                .and_then(|(id, _)| self.rec.apply_deltas(&id, &group, DeltaPolicy::default()));
            if let Err(e) = result {
                tracing::warn!(agent = %AGENT, external_id = %external_id, error = %e, "Failed to apply transcript");
            }
        }
    }

    fn process_history(&mut self) {
        let path = self.history_path();
        let lines = match self.tail.read_new_lines(&path) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(error = %e, "History read failed");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }

        for delta in HistoryDecoder::new().decode(&lines) {
            let project = delta.cwd.clone().unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
            let external_id = match &delta.session_id {
                Some(sid) => sid.clone(),
                None => match self
                    .rec
                    .cache()
                    .id_for_project(&project)
                    .and_then(|id| self.rec.session(&id).map(|s| s.external_id.clone()))
                {
                    Some(ext) => ext,
                    None => format!("history_{}", short_hash(&project)),
                },
            };

            // Transcript tailing already counts this prompt
            if self.transcript_sessions.contains(&external_id) {
                continue;
            }

            let mut candidate = Session::new(AGENT, external_id.clone(), project);
            candidate.set_meta("source", "history");
            let result = self
                .rec
                .find_or_merge(candidate)
                .and_then(|(id, _)| {
                    self.rec
                        .apply_deltas(&id, std::slice::from_ref(&delta), DeltaPolicy::default())
                });
            if let Err(e) = result {
                tracing::warn!(agent = %AGENT, external_id = %external_id, error = %e, "Failed to apply history entry");
            }
        }
    }
}

/// Split deltas by the session they name, keeping first-seen order
fn group_by_session(deltas: Vec<Delta>, fallback: &str) -> Vec<(String, Vec<Delta>)> {
    let mut groups: Vec<(String, Vec<Delta>)> = Vec::new();
    for delta in deltas {
        let key = delta.session_id.clone().unwrap_or_else(|| fallback.to_string());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(delta),
            None => groups.push((key, vec![delta])),
        }
    }
    groups
}

/// Fold one project's usage snapshot into a session. Counters only rise.
pub fn apply_stats(session: &mut Session, stats: &ProjectStats, combined_input_share: Option<f64>) {
    match stats.total_tokens {
        Some(TokenTotals::Split { input, output }) => {
            session.tokens_input = session.tokens_input.max(input);
            session.tokens_output = session.tokens_output.max(output);
        }
        Some(TokenTotals::Combined(total)) => match combined_input_share {
            Some(share) => {
                let input = (total as f64 * share).round() as i64;
                session.tokens_input = session.tokens_input.max(input);
                session.tokens_output = session.tokens_output.max(total - input);
            }
            None => session.set_meta("combined_tokens", total),
        },
        None => {}
    }
    if let Some(cost) = stats.total_cost {
        session.estimated_cost = session.estimated_cost.max(cost);
    }
    if let Some(model) = &stats.last_model {
        session.model_id = Some(model.clone());
    }
    if let Some(count) = stats.message_count {
        session.message_count = session.message_count.max(count);
    }
}

impl SourceState for ClaudeState {
    fn reconciler(&mut self) -> &mut Reconciler {
        &mut self.rec
    }

    fn discover_with(&mut self, processes: &[ProcessInfo]) -> Result<Vec<Session>> {
        let mut candidates = self.process_candidates(processes);
        candidates.extend(self.history_candidates());
        let sessions = self.rec.reconcile_candidates(candidates);

        if let Err(e) = self.load_stats() {
            tracing::warn!(agent = %AGENT, error = %e, "Failed to apply stats snapshot");
        }
        Ok(sessions)
    }

    fn prime(&mut self) {
        let mut files = self.transcript_files();
        files.push(self.history_path());
        for path in files {
            if let Err(e) = self.tail.seek_to_end(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Cannot prime tail offset");
            }
        }
    }

    fn watch_targets(&self) -> Vec<(PathBuf, bool)> {
        vec![
            (self.history_path(), false),
            (self.stats_path(), false),
            (self.projects_dir(), true),
        ]
    }

    fn poll(&mut self) {
        self.process_history();
        for path in self.transcript_files() {
            self.process_transcript(&path);
        }
        if let Err(e) = self.load_stats() {
            tracing::debug!(agent = %AGENT, error = %e, "Stats snapshot not applied");
        }
    }

    fn on_change(&mut self, path: &Path) {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == "history.jsonl" {
            self.process_history();
        } else if name == "stats-cache.json" {
            if let Err(e) = self.load_stats() {
                tracing::debug!(agent = %AGENT, error = %e, "Stats snapshot not applied");
            }
        } else if path.extension().map(|e| e == "jsonl").unwrap_or(false)
            && path.starts_with(self.projects_dir())
        {
            self.process_transcript(path);
        }
    }
}
