//! Process enumeration
//!
//! Adapters see the process table through [`ProcessSource`], so detection
//! logic can be exercised against a fixed snapshot in tests.

use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

/// One running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Seconds since the Unix epoch
    pub start_time: u64,
}

impl ProcessInfo {
    /// Space-joined command line
    pub fn cmdline_string(&self) -> String {
        self.cmdline.join(" ")
    }

    pub fn name_lower(&self) -> String {
        self.name.to_lowercase()
    }

    /// Working directory as a string, if known and non-empty
    pub fn cwd_string(&self) -> Option<String> {
        self.cwd
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        if self.start_time == 0 {
            return None;
        }
        Utc.timestamp_opt(self.start_time as i64, 0).single()
    }

    /// True for this daemon and its CLI
    pub fn is_agentmon(&self) -> bool {
        self.pid == std::process::id()
            || self.name_lower().contains("agentmon")
            || self
                .cmdline
                .first()
                .map(|arg0| arg0.contains("agentmon"))
                .unwrap_or(false)
    }
}

/// Snapshot of the running processes.
///
/// Entries the caller may not inspect are simply absent or carry empty
/// fields; a snapshot never fails as a whole.
pub trait ProcessSource: Send + Sync {
    fn snapshot(&self) -> Vec<ProcessInfo>;
}

/// Process table read through `sysinfo`
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl SystemProcesses {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSource for SystemProcesses {
    fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );

        sys.processes()
            .values()
            .map(|process| ProcessInfo {
                pid: process.pid().as_u32(),
                name: process.name().to_string(),
                cmdline: process.cmd().to_vec(),
                cwd: process
                    .cwd()
                    .map(|p| p.to_path_buf())
                    .filter(|p| !p.as_os_str().is_empty()),
                start_time: process.start_time(),
            })
            .collect()
    }
}

/// Fixed, replaceable process list for tests
#[derive(Debug, Default, Clone)]
pub struct StaticProcesses {
    processes: Arc<Mutex<Vec<ProcessInfo>>>,
}

impl StaticProcesses {
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(processes)),
        }
    }

    /// Replace the snapshot (clones share the same list)
    pub fn set(&self, processes: Vec<ProcessInfo>) {
        *self.processes.lock().unwrap() = processes;
    }
}

impl ProcessSource for StaticProcesses {
    fn snapshot(&self) -> Vec<ProcessInfo> {
        self.processes.lock().unwrap().clone()
    }
}

/// Take a snapshot off the async runtime
pub async fn snapshot_blocking(source: Arc<dyn ProcessSource>) -> Vec<ProcessInfo> {
    match tokio::task::spawn_blocking(move || source.snapshot()).await {
        Ok(processes) => processes,
        Err(e) => {
            tracing::warn!(error = %e, "Process scan task failed");
            Vec::new()
        }
    }
}
