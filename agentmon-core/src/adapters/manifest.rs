//! Manifest-described adapters
//!
//! Tools without a dedicated adapter can be monitored by dropping a
//! descriptor into `$XDG_CONFIG_HOME/agentmon/adapters/`:
//!
//! ```toml
//! name = "my_agent"
//! display_name = "My Agent"
//! process_pattern = "python.*my_agent"
//! log_path = "~/.my_agent/logs/"
//! log_format = "plain"
//! message_pattern = "\\[USER\\]"
//! poll_interval = 15
//!
//! [event_patterns]
//! tool_executed = "\\[TOOL\\]"
//! deploy = "(?i)deploy"
//! ```
//!
//! JSON descriptors with the same fields are accepted too. Every session a
//! manifest produces is stored under agent type `custom` with an external id
//! namespaced by the manifest name.

use super::reconcile::{short_hash, AdapterContext, DeltaPolicy, Reconciler, OWNER_KEY};
use super::SourceState;
use crate::config::home_dir;
use crate::error::{Error, Result};
use crate::ingest::decoders::{LogFormat, PatternDecoder};
use crate::ingest::{Decoder, Delta, FileTail};
use crate::process::ProcessInfo;
use crate::types::{AdapterCapabilities, AgentType, Session, SessionStatus, UNKNOWN_PROJECT};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const AGENT: AgentType = AgentType::Custom;

/// Pattern matches are heuristic
const CONFIDENCE: f64 = 0.7;

/// Descriptor for a manifest-driven adapter
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterManifest {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,

    /// Case-insensitive substring of the process name
    #[serde(default)]
    pub process_name: Option<String>,
    /// Case-insensitive regex matched against the command line
    #[serde(default)]
    pub process_pattern: Option<String>,

    /// A log file, or a directory of `*.log` files
    #[serde(default)]
    pub log_path: Option<String>,
    /// Directory whose subdirectories are past sessions
    #[serde(default)]
    pub data_dir: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub message_pattern: Option<String>,
    /// Event name → regex. Names matching an event type emit that type.
    #[serde(default)]
    pub event_patterns: BTreeMap<String, String>,

    #[serde(default = "default_capabilities")]
    pub capabilities: AdapterCapabilities,

    /// Seconds between polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// File the manifest was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_capabilities() -> AdapterCapabilities {
    AdapterCapabilities {
        historical_data: true,
        ..Default::default()
    }
}

fn default_poll_interval() -> u64 {
    30
}

impl AdapterManifest {
    /// Load a `.toml` or `.json` descriptor
    pub fn from_file(path: &Path) -> Result<Self> {
        let invalid = |message: String| Error::Manifest {
            path: path.to_path_buf(),
            message,
        };

        let content = std::fs::read_to_string(path)?;
        let mut manifest: AdapterManifest = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
            Some("json") => serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?,
            _ => return Err(invalid("expected a .toml or .json file".into())),
        };

        let name_ok = !manifest.name.is_empty()
            && manifest
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err(invalid(format!("invalid adapter name {:?}", manifest.name)));
        }
        manifest.source = Some(path.to_path_buf());
        Ok(manifest)
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    fn error(&self, message: String) -> Error {
        Error::Manifest {
            path: self.source.clone().unwrap_or_else(|| PathBuf::from(&self.name)),
            message,
        }
    }
}

/// Load every descriptor in `dir`, sorted by file name. Invalid files are
/// logged and skipped.
pub fn load_manifests(dir: &Path) -> Vec<AdapterManifest> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("toml") | Some("json")
                )
        })
        .collect();
    paths.sort();

    let mut manifests: Vec<AdapterManifest> = Vec::new();
    for path in paths {
        match AdapterManifest::from_file(&path) {
            Ok(manifest) if manifests.iter().any(|m| m.name == manifest.name) => {
                tracing::warn!(path = %path.display(), name = %manifest.name, "Duplicate manifest name, skipping");
            }
            Ok(manifest) => {
                tracing::info!(name = %manifest.name, path = %path.display(), "Loaded adapter manifest");
                manifests.push(manifest);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping adapter manifest"),
        }
    }
    manifests
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

pub struct ManifestState {
    rec: Reconciler,
    manifest: AdapterManifest,
    process_pattern: Option<Regex>,
    message_pattern: Option<Regex>,
    decoder: PatternDecoder,
    tail: FileTail,
}

impl ManifestState {
    /// Compile the manifest's patterns. A pattern that fails to compile is
    /// an [`Error::Manifest`].
    pub fn new(manifest: AdapterManifest, ctx: AdapterContext) -> Result<Self> {
        let compile = |pattern: &str, case_insensitive: bool| {
            RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| manifest.error(format!("bad pattern {:?}: {}", pattern, e)))
        };

        let process_pattern = manifest
            .process_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| compile(p, true))
            .transpose()?;
        let message_pattern = manifest
            .message_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| compile(p, false))
            .transpose()?;
        let mut event_patterns = Vec::with_capacity(manifest.event_patterns.len());
        for (name, pattern) in &manifest.event_patterns {
            event_patterns.push((name.clone(), compile(pattern, false)?));
        }

        let decoder = PatternDecoder::new(manifest.log_format, message_pattern.clone(), event_patterns);
        Ok(Self {
            rec: Reconciler::new(AGENT, ctx).with_owner(manifest.name.clone()),
            manifest,
            process_pattern,
            message_pattern,
            decoder,
            tail: FileTail::new(),
        })
    }

    pub fn manifest(&self) -> &AdapterManifest {
        &self.manifest
    }

    /// True if the process matches by name or command-line pattern
    pub fn matches_process(&self, process: &ProcessInfo) -> bool {
        if process.is_agentmon() {
            return false;
        }
        let by_name = self
            .manifest
            .process_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|n| process.name_lower().contains(&n.to_lowercase()))
            .unwrap_or(false);
        let by_pattern = self
            .process_pattern
            .as_ref()
            .map(|re| re.is_match(&process.cmdline_string()))
            .unwrap_or(false);
        by_name || by_pattern
    }

    /// Log files named by `log_path`
    fn log_files(&self) -> Vec<PathBuf> {
        let Some(raw) = self.manifest.log_path.as_deref().filter(|p| !p.is_empty()) else {
            return Vec::new();
        };
        let path = expand_home(raw);
        if path.is_file() {
            return vec![path];
        }
        if !path.is_dir() {
            return Vec::new();
        }
        let pattern = path.join("*.log");
        let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map(|paths| paths.filter_map(|p| p.ok()).collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    fn log_external_id(&self, path: &Path) -> String {
        format!("{}_log_{}", self.manifest.name, short_hash(&path.to_string_lossy()))
    }

    fn process_candidates(&self, processes: &[ProcessInfo]) -> Vec<Session> {
        processes
            .iter()
            .filter(|p| self.matches_process(p))
            .map(|p| {
                let cwd = p.cwd_string().unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
                let external_id = format!("{}_proc_{}", self.manifest.name, p.pid);
                let mut session = Session::new(AGENT, external_id, cwd);
                session.pid = Some(p.pid);
                if let Some(started) = p.started_at() {
                    session.started_at = started;
                    session.recompute_duration();
                }
                session.set_meta("source", "process");
                session.set_meta(OWNER_KEY, self.manifest.name.clone());
                session.set_meta("process_name", p.name.clone());
                session
            })
            .collect()
    }

    /// One candidate per log file. Lines of files not seen before are
    /// counted here and skipped by tailing.
    fn log_candidates(&mut self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for path in self.log_files() {
            let Some(project) = path.parent().map(|p| p.to_string_lossy().into_owned()) else {
                continue;
            };
            let mut session = Session::new(AGENT, self.log_external_id(&path), project);
            session.status = SessionStatus::Completed;

            if !self.tail.is_tracked(&path) {
                match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        let count = match &self.message_pattern {
                            Some(re) => content.lines().filter(|l| re.is_match(l)).count(),
                            None => content.lines().count(),
                        };
                        session.message_count = count as i64;
                    }
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Cannot read manifest log");
                        continue;
                    }
                }
                if let Err(e) = self.tail.seek_to_end(&path) {
                    tracing::debug!(path = %path.display(), error = %e, "Cannot record log offset");
                }
            }

            if let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) {
                session.last_activity_at = modified.into();
                session.started_at = session.started_at.min(session.last_activity_at);
            }
            session.ended_at = Some(session.last_activity_at);
            session.recompute_duration();
            session.set_meta("source", "log_file");
            session.set_meta(OWNER_KEY, self.manifest.name.clone());
            session.set_meta("log_file", path.to_string_lossy().into_owned());
            sessions.push(session);
        }
        sessions
    }

    fn data_dir_candidates(&self) -> Vec<Session> {
        let Some(raw) = self.manifest.data_dir.as_deref().filter(|p| !p.is_empty()) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(expand_home(raw)) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|dir| {
                let marker = dir.file_name()?.to_string_lossy().into_owned();
                let external_id = format!("{}_data_{}", self.manifest.name, marker);
                let mut session =
                    Session::new(AGENT, external_id, dir.to_string_lossy().into_owned());
                session.status = SessionStatus::Completed;
                session.ended_at = Some(session.last_activity_at);
                session.set_meta("source", "data_dir");
                session.set_meta(OWNER_KEY, self.manifest.name.clone());
                Some(session)
            })
            .collect()
    }

    /// Apply newly appended lines. JSON entries naming a session go to that
    /// session; everything else goes to the log file's session.
    fn process_log(&mut self, path: &Path) {
        let lines = match self.tail.read_new_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Manifest log read failed");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }
        let log_project = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
        let log_id = self.log_external_id(path);

        let mut groups: Vec<(String, String, Vec<Delta>)> = Vec::new();
        for delta in self.decoder.decode(&lines) {
            let external_id = match &delta.session_id {
                Some(sid) => format!("{}_{}", self.manifest.name, sid),
                None => log_id.clone(),
            };
            match groups.iter_mut().find(|(id, _, _)| *id == external_id) {
                Some((_, _, deltas)) => deltas.push(delta),
                None => {
                    let project = delta.cwd.clone().unwrap_or_else(|| log_project.clone());
                    groups.push((external_id, project, vec![delta]));
                }
            }
        }

        let policy = DeltaPolicy {
            confidence: CONFIDENCE,
            ..Default::default()
        };
        for (external_id, project, deltas) in groups {
            let mut candidate = Session::new(AGENT, external_id.clone(), project);
            candidate.set_meta("source", "log_file");
            candidate.set_meta(OWNER_KEY, self.manifest.name.clone());
            let result = self
                .rec
                .find_or_merge(candidate)
                .and_then(|(id, _)| self.rec.apply_deltas(&id, &deltas, policy));
            if let Err(e) = result {
                tracing::warn!(
                    adapter = %self.manifest.name,
                    external_id = %external_id,
                    error = %e,
                    "Failed to apply manifest log"
                );
            }
        }
    }
}

impl SourceState for ManifestState {
    fn reconciler(&mut self) -> &mut Reconciler {
        &mut self.rec
    }

    fn discover_with(&mut self, processes: &[ProcessInfo]) -> Result<Vec<Session>> {
        let mut candidates = self.process_candidates(processes);
        candidates.extend(self.log_candidates());
        candidates.extend(self.data_dir_candidates());
        Ok(self.rec.reconcile_candidates(candidates))
    }

    fn prime(&mut self) {
        for path in self.log_files() {
            if let Err(e) = self.tail.seek_to_end(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Cannot prime tail offset");
            }
        }
    }

    fn watch_targets(&self) -> Vec<(PathBuf, bool)> {
        self.manifest
            .log_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| vec![(expand_home(p), false)])
            .unwrap_or_default()
    }

    fn poll(&mut self) {
        for path in self.log_files() {
            self.process_log(&path);
        }
    }
}
