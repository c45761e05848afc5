//! Core domain types for agentmon
//!
//! These types are the shared vocabulary every other module reads and writes:
//! sessions, the immutable events that happen inside them, and the derived
//! rollups computed over time windows.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Agent** | An external AI coding tool (Claude Code, Cursor, Aider, or a manifest-described tool) |
//! | **Session** | One agent instance working against one project directory |
//! | **External identity** | The `(agent_type, external_id)` pair naming one real-world session across every detection source |
//! | **Candidate** | A freshly observed [`Session`] that has not yet been reconciled against the cache or store |
//! | **Event** | An immutable [`SessionEvent`] describing something that happened in a session |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form provenance map carried by sessions and events
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Maximum characters of free text kept on an event
pub const CONTENT_LIMIT: usize = 500;

/// Project path sentinel used when a source cannot tell where the agent runs
pub const UNKNOWN_PROJECT: &str = "/";

/// Returns true for the "unknown" project path sentinels (`/` and empty)
pub fn is_unknown_project(path: &str) -> bool {
    path.is_empty() || path == UNKNOWN_PROJECT
}

/// Truncate free text to [`CONTENT_LIMIT`] characters on a char boundary
pub fn truncate_content(text: &str) -> String {
    match text.char_indices().nth(CONTENT_LIMIT) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// ============================================
// Agent
// ============================================

/// Supported agent tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    ClaudeCode,
    Cursor,
    Aider,
    /// Manifest-described tools
    Custom,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "claude_code",
            AgentType::Cursor => "cursor",
            AgentType::Aider => "aider",
            AgentType::Custom => "custom",
        }
    }

    /// Human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "Claude Code",
            AgentType::Cursor => "Cursor",
            AgentType::Aider => "Aider",
            AgentType::Custom => "Custom",
        }
    }

    /// Built-in agent types (excludes [`AgentType::Custom`])
    pub fn builtin() -> &'static [AgentType] {
        &[AgentType::ClaudeCode, AgentType::Cursor, AgentType::Aider]
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" => Ok(AgentType::ClaudeCode),
            "cursor" => Ok(AgentType::Cursor),
            "aider" => Ok(AgentType::Aider),
            "custom" => Ok(AgentType::Custom),
            _ => Err(format!("unknown agent type: {}", s)),
        }
    }
}

// ============================================
// Session
// ============================================

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    /// Tool is open but nothing is happening
    Idle,
    Completed,
    Crashed,
    Unknown,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Unknown => "unknown",
        }
    }

    /// Completed and crashed sessions are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Crashed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "completed" => Ok(SessionStatus::Completed),
            "crashed" => Ok(SessionStatus::Crashed),
            "unknown" => Ok(SessionStatus::Unknown),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// One agent instance working against one project directory.
///
/// `id` is generated once and never changes. `external_id` is the tool-supplied
/// or synthesized identifier; together with `agent_type` it forms the natural
/// key used for reconciliation and deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Internal identifier (UUID v4)
    pub id: String,
    /// Which tool this session belongs to
    pub agent_type: AgentType,
    /// Tool-scoped identifier (session uuid, `proc_{pid}`, ...)
    pub external_id: String,
    /// Absolute project directory, or [`UNKNOWN_PROJECT`]
    pub project_path: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds between start and last activity (or end)
    pub duration_seconds: i64,
    pub message_count: i64,
    pub tool_call_count: i64,
    pub file_operations: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    /// Estimated spend in USD
    pub estimated_cost: f64,
    pub model_id: Option<String>,
    /// OS process id, when detected through a process scan or hook
    pub pid: Option<u32>,
    pub current_task: Option<String>,
    /// Progress hint in `[0, 1]`
    pub progress: Option<f64>,
    /// When the record was first created (immutable)
    pub created_at: DateTime<Utc>,
    /// Tool-specific provenance; merged, never replaced
    #[serde(default)]
    pub metadata: Metadata,
}

impl Session {
    /// Create a fresh ACTIVE session observed right now
    pub fn new(
        agent_type: AgentType,
        external_id: impl Into<String>,
        project_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_type,
            external_id: external_id.into(),
            project_path: project_path.into(),
            status: SessionStatus::Active,
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            duration_seconds: 0,
            message_count: 0,
            tool_call_count: 0,
            file_operations: 0,
            tokens_input: 0,
            tokens_output: 0,
            estimated_cost: 0.0,
            model_id: None,
            pid: None,
            current_task: None,
            progress: None,
            created_at: now,
            metadata: Metadata::new(),
        }
    }

    /// Returns true if the project path is a concrete directory
    pub fn has_known_project(&self) -> bool {
        !is_unknown_project(&self.project_path)
    }

    /// Display name for the project (last path component)
    pub fn project_name(&self) -> &str {
        self.project_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
    }

    /// Mark activity now
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    /// Mark activity at `ts`; last activity never moves backwards
    pub fn touch_at(&mut self, ts: DateTime<Utc>) {
        if ts > self.last_activity_at {
            self.last_activity_at = ts;
        }
        if ts < self.started_at {
            self.started_at = ts;
        }
        self.recompute_duration();
    }

    /// Close the session with a terminal status
    pub fn end(&mut self, status: SessionStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now.max(self.last_activity_at));
        self.recompute_duration();
    }

    /// Recompute `duration_seconds` from start to end or last activity
    pub fn recompute_duration(&mut self) {
        let end = self.ended_at.unwrap_or(self.last_activity_at);
        self.duration_seconds = (end - self.started_at).num_seconds().max(0);
    }

    /// Union `other` into this session's metadata, `other` winning on collision
    pub fn merge_metadata(&mut self, other: &Metadata) {
        for (key, value) in other {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Set a single metadata entry
    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Add token usage; counters only grow
    pub fn add_tokens(&mut self, input: i64, output: i64) {
        self.tokens_input += input.max(0);
        self.tokens_output += output.max(0);
    }

    /// Raise counters to at least the values observed on `other`
    pub fn absorb_counters(&mut self, other: &Session) {
        self.message_count = self.message_count.max(other.message_count);
        self.tool_call_count = self.tool_call_count.max(other.tool_call_count);
        self.file_operations = self.file_operations.max(other.file_operations);
        self.tokens_input = self.tokens_input.max(other.tokens_input);
        self.tokens_output = self.tokens_output.max(other.tokens_output);
        self.estimated_cost = self.estimated_cost.max(other.estimated_cost);
    }
}

// ============================================
// Events
// ============================================

/// Kind of fact recorded by a [`SessionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Lifecycle
    SessionStart,
    SessionEnd,
    SessionPause,
    SessionResume,

    // Conversation
    PromptReceived,
    ResponseStarted,
    ResponseGenerated,
    ResponseCompleted,
    Thinking,

    // Tools
    ToolExecuted,
    ToolStart,
    ToolComplete,
    ToolError,
    ToolPermissionRequest,
    ToolPermissionResponse,

    // Files
    FileRead,
    FileWrite,
    FileEdit,
    FileDelete,
    FileModified,

    // Subagents
    SubagentStart,
    SubagentStop,

    // Diagnostics
    Error,
    Warning,

    // Usage
    TokenUsage,
    CostEstimate,

    Custom,
}

impl EventType {
    pub const ALL: [EventType; 27] = [
        EventType::SessionStart,
        EventType::SessionEnd,
        EventType::SessionPause,
        EventType::SessionResume,
        EventType::PromptReceived,
        EventType::ResponseStarted,
        EventType::ResponseGenerated,
        EventType::ResponseCompleted,
        EventType::Thinking,
        EventType::ToolExecuted,
        EventType::ToolStart,
        EventType::ToolComplete,
        EventType::ToolError,
        EventType::ToolPermissionRequest,
        EventType::ToolPermissionResponse,
        EventType::FileRead,
        EventType::FileWrite,
        EventType::FileEdit,
        EventType::FileDelete,
        EventType::FileModified,
        EventType::SubagentStart,
        EventType::SubagentStop,
        EventType::Error,
        EventType::Warning,
        EventType::TokenUsage,
        EventType::CostEstimate,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::SessionPause => "session_pause",
            EventType::SessionResume => "session_resume",
            EventType::PromptReceived => "prompt_received",
            EventType::ResponseStarted => "response_started",
            EventType::ResponseGenerated => "response_generated",
            EventType::ResponseCompleted => "response_completed",
            EventType::Thinking => "thinking",
            EventType::ToolExecuted => "tool_executed",
            EventType::ToolStart => "tool_start",
            EventType::ToolComplete => "tool_complete",
            EventType::ToolError => "tool_error",
            EventType::ToolPermissionRequest => "tool_permission_request",
            EventType::ToolPermissionResponse => "tool_permission_response",
            EventType::FileRead => "file_read",
            EventType::FileWrite => "file_write",
            EventType::FileEdit => "file_edit",
            EventType::FileDelete => "file_delete",
            EventType::FileModified => "file_modified",
            EventType::SubagentStart => "subagent_start",
            EventType::SubagentStop => "subagent_stop",
            EventType::Error => "error",
            EventType::Warning => "warning",
            EventType::TokenUsage => "token_usage",
            EventType::CostEstimate => "cost_estimate",
            EventType::Custom => "custom",
        }
    }

    /// File operation implied by a file event type
    pub fn file_operation(&self) -> Option<FileOperation> {
        match self {
            EventType::FileRead => Some(FileOperation::Read),
            EventType::FileWrite => Some(FileOperation::Write),
            EventType::FileEdit => Some(FileOperation::Edit),
            EventType::FileDelete => Some(FileOperation::Delete),
            EventType::FileModified => Some(FileOperation::Modified),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Edit,
    Delete,
    Modified,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Read => "read",
            FileOperation::Write => "write",
            FileOperation::Edit => "edit",
            FileOperation::Delete => "delete",
            FileOperation::Modified => "modified",
        }
    }

    /// Anything other than a read changes the file
    pub fn is_mutation(&self) -> bool {
        !matches!(self, FileOperation::Read)
    }
}

impl FromStr for FileOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(FileOperation::Read),
            "write" => Ok(FileOperation::Write),
            "edit" => Ok(FileOperation::Edit),
            "delete" => Ok(FileOperation::Delete),
            "modified" => Ok(FileOperation::Modified),
            _ => Err(format!("unknown file operation: {}", s)),
        }
    }
}

/// An immutable fact about something that happened inside a session.
///
/// Built once by an adapter when a signal is normalized, persisted append-only
/// and then published on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    /// Owning session (internal id)
    pub session_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub agent_type: AgentType,
    /// Free text, truncated to [`CONTENT_LIMIT`] characters
    pub content: Option<String>,

    // Tool fields
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_output: Option<serde_json::Value>,
    pub tool_duration_ms: Option<i64>,
    pub tool_success: Option<bool>,

    // File fields
    pub file_path: Option<String>,
    pub file_operation: Option<FileOperation>,

    // Usage deltas
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub estimated_cost: Option<f64>,
    pub model_used: Option<String>,

    // Subagents
    pub parent_session_id: Option<String>,
    pub subagent_task: Option<String>,

    // Errors
    pub error_type: Option<String>,
    pub error_message: Option<String>,

    /// 1.0 for hook-sourced ground truth, lower for heuristic extraction
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Metadata,
    /// Original payload, for debugging and replay
    pub raw_data: Option<serde_json::Value>,
}

impl SessionEvent {
    /// Create an event stamped now with full confidence
    pub fn new(session_id: impl Into<String>, event_type: EventType, agent_type: AgentType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            event_type,
            timestamp: Utc::now(),
            agent_type,
            content: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            tool_duration_ms: None,
            tool_success: None,
            file_path: None,
            file_operation: event_type.file_operation(),
            tokens_input: None,
            tokens_output: None,
            estimated_cost: None,
            model_used: None,
            parent_session_id: None,
            subagent_task: None,
            error_type: None,
            error_message: None,
            confidence: 1.0,
            metadata: Metadata::new(),
            raw_data: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Some(truncate_content(content));
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, input: Option<serde_json::Value>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_input = input;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, operation: FileOperation) -> Self {
        self.file_path = Some(path.into());
        self.file_operation = Some(operation);
        self
    }

    pub fn with_tokens(mut self, input: i64, output: i64) -> Self {
        self.tokens_input = Some(input);
        self.tokens_output = Some(output);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    pub fn with_error(mut self, kind: impl Into<String>, message: &str) -> Self {
        self.error_type = Some(kind.into());
        self.error_message = Some(truncate_content(message));
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_data = Some(raw);
        self
    }
}

// ============================================
// Adapters
// ============================================

/// What an adapter can observe. Consumed by presentation layers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterCapabilities {
    pub real_time_events: bool,
    pub historical_data: bool,
    pub token_tracking: bool,
    pub cost_tracking: bool,
    pub file_change_tracking: bool,
    pub hook_integration: bool,
    pub transcript_access: bool,
}

// ============================================
// Daemon
// ============================================

/// Lifecycle state of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Initializing => "initializing",
            DaemonState::Running => "running",
            DaemonState::ShuttingDown => "shutting_down",
            DaemonState::Stopped => "stopped",
        }
    }
}

// ============================================
// Derived metrics
// ============================================

/// Outcome of a deduplication sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    /// Sessions sharing an external identity with at least one other
    pub duplicates_found: usize,
    /// Loser rows deleted
    pub duplicates_removed: usize,
    /// Events re-parented onto survivors
    pub events_migrated: usize,
}

/// Rollup for one agent type over a time window (persisted per hour)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_type: AgentType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub session_count: i64,
    pub active_sessions: i64,
    pub message_count: i64,
    pub tool_call_count: i64,
    pub file_operations: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub estimated_cost: f64,
    /// Sessions per model id
    pub model_usage: BTreeMap<String, i64>,
    /// Sessions started per hour of day (0-23)
    pub hourly_distribution: BTreeMap<u32, i64>,
}

/// Dashboard summary across sessions started in the last N hours
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub hours: i64,
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub completed_sessions: i64,
    pub crashed_sessions: i64,
    pub total_messages: i64,
    pub total_tool_calls: i64,
    pub total_tokens_input: i64,
    pub total_tokens_output: i64,
    pub total_cost: f64,
    pub avg_session_duration: f64,
    pub model_usage: BTreeMap<String, i64>,
    pub hourly_distribution: BTreeMap<u32, i64>,
}
