//! Decoder for manifest-described tools
//!
//! The manifest supplies the grammar: a log format, an optional message
//! pattern and a table of named event patterns.

use crate::ingest::{parse_rfc3339, Decoder, Delta, DeltaKind};
use regex::Regex;
use serde::Deserialize;

/// Line format of a manifest tool's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

/// Decoder driven by compiled manifest patterns
#[derive(Debug)]
pub struct PatternDecoder {
    format: LogFormat,
    message_pattern: Option<Regex>,
    event_patterns: Vec<(String, Regex)>,
}

impl PatternDecoder {
    pub fn new(
        format: LogFormat,
        message_pattern: Option<Regex>,
        event_patterns: Vec<(String, Regex)>,
    ) -> Self {
        Self {
            format,
            message_pattern,
            event_patterns,
        }
    }

    fn decode_plain(&self, line: &str, out: &mut Vec<Delta>) {
        for (name, pattern) in &self.event_patterns {
            if pattern.is_match(line) {
                out.push(Delta::new(DeltaKind::Custom {
                    name: name.clone(),
                    text: line.to_string(),
                }));
            }
        }
        if self.is_message(line) {
            out.push(Delta::new(DeltaKind::Prompt {
                text: line.to_string(),
            }));
        }
    }

    fn decode_json(&self, line: &str, out: &mut Vec<Delta>) {
        let entry: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return,
        };
        let Some(object) = entry.as_object() else {
            return;
        };

        let str_field = |key: &str| object.get(key).and_then(|v| v.as_str()).map(String::from);
        let int_field = |key: &str| object.get(key).and_then(|v| v.as_i64());

        let session_id = str_field("session_id");
        let cwd = str_field("cwd");
        let timestamp = str_field("timestamp").as_deref().and_then(parse_rfc3339);
        let stamp = |kind: DeltaKind| {
            Delta::new(kind)
                .with_session(session_id.clone())
                .with_cwd(cwd.clone())
                .at(timestamp)
        };

        let name = str_field("event")
            .or_else(|| str_field("type"))
            .unwrap_or_else(|| "log_entry".to_string());
        let text = str_field("message").unwrap_or_else(|| line.to_string());
        out.push(
            stamp(DeltaKind::Custom {
                name,
                text: text.clone(),
            })
            .with_raw(entry.clone()),
        );

        if let Some(model) = str_field("model") {
            out.push(stamp(DeltaKind::Model { model }));
        }
        let input = int_field("tokens_input").unwrap_or(0);
        let output = int_field("tokens_output").unwrap_or(0);
        if input > 0 || output > 0 {
            out.push(stamp(DeltaKind::Tokens { input, output }));
        }
        if let Some(amount) = object.get("cost").and_then(|v| v.as_f64()) {
            out.push(stamp(DeltaKind::Cost {
                amount,
                session_total: None,
            }));
        }
        if self.is_message(&text) {
            out.push(stamp(DeltaKind::Prompt { text }));
        }
    }

    /// True if the line counts as a message
    pub fn is_message(&self, line: &str) -> bool {
        self.message_pattern
            .as_ref()
            .map(|re| re.is_match(line))
            .unwrap_or(false)
    }
}

impl Decoder for PatternDecoder {
    fn decode(&mut self, lines: &[String]) -> Vec<Delta> {
        let mut out = Vec::new();
        for line in lines {
            match self.format {
                LogFormat::Plain => self.decode_plain(line, &mut out),
                LogFormat::Json => self.decode_json(line, &mut out),
            }
        }
        out
    }
}
