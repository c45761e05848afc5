//! IPC protocol
//!
//! Newline-delimited JSON over a Unix domain socket. Each request line is an
//! object tagged by `action`; each response line is an object carrying
//! `"ok"`. Subscribed connections additionally receive event pushes:
//!
//! ```text
//! → {"action":"get_sessions","agent_types":["claude_code"],"limit":10}
//! ← {"ok":true,"sessions":[...]}
//! → {"action":"subscribe","filters":{"event_types":["tool_start"]}}
//! ← {"ok":true,"status":"subscribed"}
//! ← {"type":"event","data":{...}}
//! ```

use crate::bus::EventFilter;
use crate::error::{Error, Result};
use crate::types::{AgentType, EventType, SessionEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Default row limit for list actions
pub const DEFAULT_LIMIT: usize = 100;

/// Default window for `get_metrics`
pub const DEFAULT_METRICS_HOURS: i64 = 24;

/// Default window for `get_events` without a session
pub const DEFAULT_EVENTS_MINUTES: i64 = 60;

/// A client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    GetStatus,
    /// Active sessions, newest activity first
    GetSessions {
        #[serde(default)]
        agent_types: Vec<AgentType>,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetSession {
        session_id: String,
    },
    GetMetrics {
        #[serde(default)]
        agent_type: Option<AgentType>,
        #[serde(default)]
        hours: Option<i64>,
    },
    GetEvents {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        minutes: Option<i64>,
        #[serde(default)]
        event_types: Vec<EventType>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Subscribe {
        #[serde(default)]
        filters: EventFilter,
    },
    Unsubscribe,
    /// Forwarded by `agentmon hook <event_type>`
    HookEvent {
        event_type: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::GetStatus => "get_status",
            Request::GetSessions { .. } => "get_sessions",
            Request::GetSession { .. } => "get_session",
            Request::GetMetrics { .. } => "get_metrics",
            Request::GetEvents { .. } => "get_events",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe => "unsubscribe",
            Request::HookEvent { .. } => "hook_event",
        }
    }

    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Ipc(format!("invalid request: {}", e)))
    }
}

/// A response line: `{"ok": true, ...payload}` or `{"ok": false, "error": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Response {
    /// Success with the fields of `payload` (non-objects go under `data`)
    pub fn ok(payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            ok: true,
            error: None,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            payload: Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Deserialize one payload field
    pub fn field<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .payload
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Ipc(format!("response has no {:?} field", key)))?;
        Ok(serde_json::from_value(value)?)
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Response::error(e.to_string())
    }
}

/// Event push sent to subscribed connections
pub fn event_message(event: &SessionEvent) -> Value {
    json!({ "type": "event", "data": event })
}

/// Serialize a message as one protocol line (with trailing newline)
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Send one request and wait for its response line
pub async fn send_request(socket: &Path, request: &Request, timeout: Duration) -> Result<Response> {
    let exchange = async {
        let stream = UnixStream::connect(socket).await?;
        let (read, mut write) = stream.into_split();
        write.write_all(encode_line(request)?.as_bytes()).await?;
        write.flush().await?;

        let mut reader = BufReader::new(read);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Ipc("connection closed before response".into()));
        }
        Ok::<Response, Error>(serde_json::from_str(line.trim_end())?)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Ipc(format!("no response within {:?}", timeout)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requests() {
        assert_eq!(Request::parse(r#"{"action":"get_status"}"#).unwrap(), Request::GetStatus);

        let req = Request::parse(r#"{"action":"get_sessions","agent_types":["aider"]}"#).unwrap();
        assert_eq!(
            req,
            Request::GetSessions {
                agent_types: vec![AgentType::Aider],
                limit: None
            }
        );

        let req = Request::parse(
            r#"{"action":"subscribe","filters":{"event_types":["tool_start"],"project_prefixes":["/repo"]}}"#,
        )
        .unwrap();
        let Request::Subscribe { filters } = req else {
            panic!("expected subscribe");
        };
        assert_eq!(filters.event_types, vec![EventType::ToolStart]);
        assert!(filters.agent_types.is_empty());

        let req = Request::parse(
            r#"{"action":"hook_event","event_type":"tool_start","data":{"session_id":"x"},"timestamp":"2025-01-15T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(req.action(), "hook_event");

        assert!(matches!(Request::parse("{not json"), Err(Error::Ipc(_))));
        assert!(Request::parse(r#"{"action":"reboot"}"#).is_err());
        assert!(Request::parse(r#"{"action":"get_session"}"#).is_err());
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(Response::ok(json!({"sessions": []}))).unwrap();
        assert_eq!(ok, json!({"ok": true, "sessions": []}));

        let err = serde_json::to_value(Response::error("nope")).unwrap();
        assert_eq!(err, json!({"ok": false, "error": "nope"}));

        let parsed: Response = serde_json::from_value(json!({"ok": true, "count": 3})).unwrap();
        assert_eq!(parsed.field::<i64>("count").unwrap(), 3);
        assert!(parsed.field::<i64>("missing").is_err());
    }

    #[test]
    fn test_event_message_and_line() {
        let event = SessionEvent::new("s-1", EventType::ToolStart, AgentType::ClaudeCode);
        let message = event_message(&event);
        assert_eq!(message["type"], "event");
        assert_eq!(message["data"]["event_type"], "tool_start");

        let line = encode_line(&message).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[tokio::test]
    async fn test_send_request_without_server_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = send_request(
            &dir.path().join("missing.sock"),
            &Request::GetStatus,
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }
}
