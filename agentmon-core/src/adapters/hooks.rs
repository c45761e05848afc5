//! Claude Code hook integration
//!
//! Claude Code runs `agentmon hook <event>` with a JSON payload on stdin at
//! lifecycle points. The CLI forwards the payload to the daemon, which lands
//! here. Hooks are ground truth, so events carry full confidence.

use super::claude::ClaudeState;
use super::reconcile::classify_tool;
use crate::error::{Error, Result};
use crate::types::{AgentType, EventType, Session, SessionEvent, SessionStatus, UNKNOWN_PROJECT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::str::FromStr;

/// Marker used to recognise hooks this tool installed
const HOOK_COMMAND: &str = "agentmon hook";

/// Hook timeout in seconds written to settings
const HOOK_TIMEOUT: u64 = 5;

/// Settings key → hook subcommand argument
const HOOK_EVENTS: &[(&str, &str, bool)] = &[
    ("SessionStart", "session_start", false),
    ("SessionEnd", "session_end", false),
    ("UserPromptSubmit", "prompt_submit", false),
    ("PreToolUse", "tool_start", true),
    ("PostToolUse", "tool_complete", true),
    ("SubagentStop", "subagent_stop", false),
];

/// Kinds of hook notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    SessionStart,
    SessionEnd,
    ToolStart,
    ToolComplete,
    ToolError,
    PromptSubmit,
    SubagentStart,
    SubagentStop,
    Stop,
    Notification,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::SessionStart => "session_start",
            HookKind::SessionEnd => "session_end",
            HookKind::ToolStart => "tool_start",
            HookKind::ToolComplete => "tool_complete",
            HookKind::ToolError => "tool_error",
            HookKind::PromptSubmit => "prompt_submit",
            HookKind::SubagentStart => "subagent_start",
            HookKind::SubagentStop => "subagent_stop",
            HookKind::Stop => "stop",
            HookKind::Notification => "notification",
        }
    }
}

impl FromStr for HookKind {
    type Err = String;

    /// Accepts the subcommand names and Claude Code's own event names
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "session_start" | "SessionStart" => Ok(HookKind::SessionStart),
            "session_end" | "SessionEnd" => Ok(HookKind::SessionEnd),
            "tool_start" | "PreToolUse" => Ok(HookKind::ToolStart),
            "tool_complete" | "PostToolUse" => Ok(HookKind::ToolComplete),
            "tool_error" | "PostToolUseFailure" => Ok(HookKind::ToolError),
            "prompt_submit" | "UserPromptSubmit" => Ok(HookKind::PromptSubmit),
            "subagent_start" | "SubagentStart" => Ok(HookKind::SubagentStart),
            "subagent_stop" | "SubagentStop" => Ok(HookKind::SubagentStop),
            "stop" | "Stop" => Ok(HookKind::Stop),
            "notification" | "Notification" => Ok(HookKind::Notification),
            _ => Err(format!("unknown hook event: {}", s)),
        }
    }
}

/// Payload Claude Code writes to a hook's stdin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookPayload {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub transcript_path: Option<String>,
    pub hook_event_name: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_response: Option<Value>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub source: Option<String>,
    pub message: Option<String>,
    pub agent_id: Option<String>,
    pub agent_type: Option<String>,
    /// External id of the session that spawned a subagent, when the agent reports one
    pub parent_session_id: Option<String>,
    pub error: Option<String>,
}

impl HookPayload {
    /// Resolve the hook kind from the subcommand name, falling back to the
    /// payload's own event name
    pub fn resolve_kind(&self, event_type: &str) -> Result<HookKind> {
        HookKind::from_str(event_type)
            .or_else(|e| {
                self.hook_event_name
                    .as_deref()
                    .map(HookKind::from_str)
                    .unwrap_or(Err(e))
            })
            .map_err(Error::InvalidRecord)
    }
}

impl ClaudeState {
    /// Internal id of a session this adapter has already seen
    fn known_session(&self, external_id: &str) -> Result<Option<String>> {
        if let Some(id) = self.rec.cache().id_for_external(external_id) {
            return Ok(Some(id));
        }
        Ok(self
            .rec
            .context()
            .db
            .get_session_by_external_id(AgentType::ClaudeCode, external_id)?
            .map(|s| s.id))
    }

    /// Reconcile a hook notification and emit its event. Returns the
    /// internal session id.
    pub fn handle_hook(
        &mut self,
        kind: HookKind,
        payload: HookPayload,
        at: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let external_id = payload
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidRecord("hook payload has no session_id".into()))?;
        let at = at.unwrap_or_else(Utc::now);

        let project = payload
            .cwd
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
        let mut candidate = Session::new(AgentType::ClaudeCode, external_id.clone(), project);
        candidate.last_activity_at = at;
        candidate.model_id = payload.model.clone();
        candidate.set_meta("source", "hook");
        candidate.set_meta("hooks", true);
        if let Some(path) = &payload.transcript_path {
            candidate.set_meta("transcript_path", path.clone());
        }
        if kind == HookKind::SessionEnd {
            candidate.status = SessionStatus::Completed;
        }

        let (id, created) = self.rec.find_or_merge(candidate)?;
        let counts = !self.transcript_sessions.contains(&external_id);
        let tool_name = payload.tool_name.clone().unwrap_or_else(|| "unknown".to_string());

        let event = match kind {
            HookKind::SessionStart => {
                if created {
                    // find_or_merge already announced it
                    return Ok(id);
                }
                let mut event = SessionEvent::new(&id, EventType::SessionStart, AgentType::ClaudeCode);
                if let Some(source) = &payload.source {
                    event = event.with_meta("source", source.clone());
                }
                event
            }
            HookKind::SessionEnd => {
                self.rec.update(&id, |s| s.end(SessionStatus::Completed))?;
                let mut event = SessionEvent::new(&id, EventType::SessionEnd, AgentType::ClaudeCode);
                if let Some(reason) = &payload.source {
                    event = event.with_meta("reason", reason.clone());
                }
                event
            }
            HookKind::ToolStart => {
                if counts {
                    let mutation = classify_tool(&tool_name) == EventType::FileModified;
                    self.rec.update(&id, |s| {
                        s.tool_call_count += 1;
                        if mutation {
                            s.file_operations += 1;
                        }
                        s.current_task = Some(tool_name.clone());
                    })?;
                }
                SessionEvent::new(&id, EventType::ToolStart, AgentType::ClaudeCode)
                    .with_tool(tool_name.clone(), payload.tool_input.clone())
                    .with_content(&tool_name)
            }
            HookKind::ToolComplete | HookKind::ToolError => {
                self.rec.update(&id, |s| {
                    s.touch_at(at);
                    s.current_task = None;
                })?;
                let failed = kind == HookKind::ToolError || payload.error.is_some();
                let event_type = if failed {
                    EventType::ToolError
                } else {
                    EventType::ToolComplete
                };
                let mut event = SessionEvent::new(&id, event_type, AgentType::ClaudeCode)
                    .with_tool(tool_name.clone(), payload.tool_input.clone())
                    .with_content(&tool_name);
                event.tool_output = payload.tool_response.clone();
                event.tool_success = Some(!failed);
                if let Some(message) = &payload.error {
                    event = event.with_error("tool_error", message);
                }
                event
            }
            HookKind::PromptSubmit => {
                if counts {
                    self.rec.update(&id, |s| s.message_count += 1)?;
                }
                SessionEvent::new(&id, EventType::PromptReceived, AgentType::ClaudeCode)
                    .with_content(payload.prompt.as_deref().unwrap_or(""))
            }
            HookKind::SubagentStart | HookKind::SubagentStop => {
                let event_type = if kind == HookKind::SubagentStart {
                    EventType::SubagentStart
                } else {
                    EventType::SubagentStop
                };
                let mut event = SessionEvent::new(&id, event_type, AgentType::ClaudeCode);
                event.parent_session_id = match payload.parent_session_id.as_deref() {
                    Some(parent) if !parent.is_empty() && parent != external_id => {
                        self.known_session(parent)?
                    }
                    _ => None,
                };
                event.subagent_task = payload.agent_type.clone();
                if let Some(agent_id) = &payload.agent_id {
                    event = event.with_meta("agent_id", agent_id.clone());
                }
                event
            }
            HookKind::Stop => SessionEvent::new(&id, EventType::ResponseCompleted, AgentType::ClaudeCode),
            HookKind::Notification => {
                SessionEvent::new(&id, EventType::Custom, AgentType::ClaudeCode)
                    .with_meta("name", "notification")
                    .with_content(payload.message.as_deref().unwrap_or(""))
            }
        };

        let mut event = event.at(at).with_meta("hook", kind.as_str());
        if let Some(model) = &payload.model {
            event = event.with_model(model.clone());
        }
        if let Ok(raw) = serde_json::to_value(&payload) {
            event = event.with_raw(raw);
        }
        self.rec.emit(event);

        tracing::debug!(
            hook = kind.as_str(),
            session_id = %id,
            external_id = %external_id,
            "Hook event handled"
        );
        Ok(id)
    }
}

// ============================================
// Installation
// ============================================

fn hook_entry(argument: &str, with_matcher: bool) -> Value {
    let mut entry = json!({
        "hooks": [{
            "type": "command",
            "command": format!("{} {}", HOOK_COMMAND, argument),
            "timeout": HOOK_TIMEOUT,
        }]
    });
    if with_matcher {
        entry["matcher"] = json!(".*");
    }
    entry
}

/// Merge agentmon hooks into `<claude_home>/settings.json`.
///
/// Existing settings and hooks are preserved; event keys that already carry
/// an agentmon hook are left alone. Returns true if the file was written.
pub fn install_hooks(claude_home: &Path) -> Result<bool> {
    let settings_path = claude_home.join("settings.json");

    let mut settings: Value = if settings_path.exists() {
        let content = std::fs::read_to_string(&settings_path)?;
        if content.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("cannot parse {}: {}", settings_path.display(), e))
            })?
        }
    } else {
        json!({})
    };

    let Some(root) = settings.as_object_mut() else {
        return Err(Error::Config(format!(
            "{} is not a JSON object",
            settings_path.display()
        )));
    };
    let hooks = root.entry("hooks").or_insert_with(|| json!({}));
    let Some(hooks) = hooks.as_object_mut() else {
        return Err(Error::Config("settings.hooks is not an object".into()));
    };

    let mut modified = false;
    for (key, argument, with_matcher) in HOOK_EVENTS {
        let list = hooks.entry(key.to_string()).or_insert_with(|| json!([]));
        let Some(list) = list.as_array_mut() else {
            tracing::warn!(hook = key, "Hook list is not an array, leaving it alone");
            continue;
        };
        let installed = list.iter().any(|h| h.to_string().contains(HOOK_COMMAND));
        if !installed {
            list.push(hook_entry(argument, *with_matcher));
            modified = true;
        }
    }

    if modified {
        std::fs::create_dir_all(claude_home)?;
        std::fs::write(&settings_path, serde_json::to_string_pretty(&settings)?)?;
        tracing::info!(path = %settings_path.display(), "Installed hooks");
    } else {
        tracing::debug!(path = %settings_path.display(), "Hooks already installed");
    }
    Ok(modified)
}
