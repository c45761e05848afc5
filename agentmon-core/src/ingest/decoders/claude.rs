//! Claude Code decoders
//!
//! Three sources live under `~/.claude`:
//!
//! - `projects/[encoded-path]/<session>.jsonl`: the conversation transcript,
//!   one JSON record per line ([`TranscriptDecoder`])
//! - `history.jsonl`: one entry per submitted prompt, across all projects
//!   ([`HistoryDecoder`], [`HistoryEntry`])
//! - `stats-cache.json`: a periodically rewritten per-project usage snapshot
//!   ([`parse_stats_cache`])
//!
//! Malformed lines are skipped. Missing fields fall back to `#[serde(default)]`.

use crate::error::{Error, Result};
use crate::ingest::{from_millis, parse_rfc3339, Decoder, Delta, DeltaKind};
use chrono::{DateTime, Utc};
use serde::Deserialize;

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// A single line from a transcript
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    role: Option<String>,
    model: Option<String>,
    content: Option<RawContent>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    // tool_result, image, ...
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

// ============================================
// Transcript
// ============================================

/// Decoder for conversation transcripts.
///
/// The transcript's file stem is its session id; records that omit
/// `sessionId` inherit it.
#[derive(Debug, Default)]
pub struct TranscriptDecoder {
    file_session_id: Option<String>,
}

impl TranscriptDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for a transcript whose file stem is `session_id`
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            file_session_id: Some(session_id.into()),
        }
    }

    fn decode_line(&self, line: &str, out: &mut Vec<Delta>) {
        let raw: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed transcript line");
                return;
            }
        };
        let record: RawRecord = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unrecognized transcript record");
                return;
            }
        };

        if record.is_sidechain.unwrap_or(false) {
            return;
        }
        let role = record
            .record_type
            .clone()
            .or_else(|| record.message.as_ref().and_then(|m| m.role.clone()));
        let Some(role) = role else {
            return;
        };
        if role != "user" && role != "assistant" {
            return;
        }

        let session_id = record.session_id.clone().or_else(|| self.file_session_id.clone());
        let timestamp = record.timestamp.as_deref().and_then(parse_rfc3339);
        let stamp = |kind: DeltaKind| {
            Delta::new(kind)
                .with_session(session_id.clone())
                .with_cwd(record.cwd.clone())
                .at(timestamp)
        };

        let Some(message) = record.message else {
            return;
        };

        if role == "user" {
            let text = match &message.content {
                Some(RawContent::Text(text)) => text.clone(),
                Some(RawContent::Blocks(blocks)) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => String::new(),
            };
            // Tool results arrive as user records with no text
            if !text.trim().is_empty() {
                out.push(stamp(DeltaKind::Prompt { text }).with_raw(raw));
            }
            return;
        }

        if let Some(model) = message.model.filter(|m| !m.is_empty() && m != "<synthetic>") {
            out.push(stamp(DeltaKind::Model { model }));
        }

        if let Some(usage) = message.usage {
            let input = usage.input_tokens.unwrap_or(0);
            let output = usage.output_tokens.unwrap_or(0);
            if input > 0 || output > 0 {
                out.push(stamp(DeltaKind::Tokens { input, output }));
            }
        }

        match message.content {
            Some(RawContent::Text(text)) if !text.trim().is_empty() => {
                out.push(stamp(DeltaKind::Response { text }));
            }
            Some(RawContent::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } if !text.trim().is_empty() => {
                            out.push(stamp(DeltaKind::Response { text }));
                        }
                        ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                            out.push(stamp(DeltaKind::Thinking { text: thinking }));
                        }
                        ContentBlock::ToolUse { name, input } => {
                            out.push(stamp(DeltaKind::ToolUse {
                                name,
                                input: Some(input),
                            }));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

impl Decoder for TranscriptDecoder {
    fn decode(&mut self, lines: &[String]) -> Vec<Delta> {
        let mut out = Vec::new();
        for line in lines {
            self.decode_line(line, &mut out);
        }
        out
    }
}

// ============================================
// History
// ============================================

/// One line of `history.jsonl`
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Prompt text as shown to the user
    pub display: String,
    pub project: String,
    pub session_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawHistoryEntry {
    display: Option<String>,
    project: Option<String>,
    session_id: Option<String>,
    timestamp: Option<i64>,
}

impl HistoryEntry {
    /// Parse one line; entries without a project are ignored
    pub fn parse(line: &str) -> Option<Self> {
        let raw: RawHistoryEntry = serde_json::from_str(line).ok()?;
        let project = raw.project.filter(|p| !p.is_empty())?;
        Some(Self {
            display: raw.display.unwrap_or_default(),
            project,
            session_id: raw.session_id.filter(|s| !s.is_empty()),
            timestamp: raw.timestamp.and_then(from_millis),
        })
    }
}

/// Decoder for newly appended `history.jsonl` lines: each is a prompt
#[derive(Debug, Default)]
pub struct HistoryDecoder;

impl HistoryDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for HistoryDecoder {
    fn decode(&mut self, lines: &[String]) -> Vec<Delta> {
        lines
            .iter()
            .filter_map(|line| {
                let entry = HistoryEntry::parse(line)?;
                let raw = serde_json::from_str(line).ok()?;
                Some(
                    Delta::new(DeltaKind::Prompt {
                        text: entry.display,
                    })
                    .with_session(entry.session_id)
                    .with_cwd(Some(entry.project))
                    .at(entry.timestamp)
                    .with_raw(raw),
                )
            })
            .collect()
    }
}

// ============================================
// Stats cache
// ============================================

/// Token totals as reported by the stats snapshot
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TokenTotals {
    /// Input and output reported separately
    Split {
        #[serde(default)]
        input: i64,
        #[serde(default)]
        output: i64,
    },
    /// Only a combined total is known
    Combined(i64),
}

/// Usage snapshot for one project
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectStats {
    pub project_path: String,
    pub total_tokens: Option<TokenTotals>,
    pub total_cost: Option<f64>,
    pub last_model: Option<String>,
    pub message_count: Option<i64>,
    pub last_session_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawProjectStats {
    total_tokens: Option<TokenTotals>,
    total_cost: Option<f64>,
    last_model: Option<String>,
    message_count: Option<i64>,
    last_session_id: Option<String>,
}

/// Parse `stats-cache.json`, a map of project path to usage.
///
/// Entries that are not objects, or whose key is not a concrete path, are
/// skipped.
pub fn parse_stats_cache(content: &str) -> Result<Vec<ProjectStats>> {
    let root: serde_json::Map<String, serde_json::Value> = serde_json::from_str(content)
        .map_err(|e| Error::parse("stats-cache.json", e.to_string()))?;

    let mut stats = Vec::new();
    for (project_path, value) in root {
        if crate::types::is_unknown_project(&project_path) || !value.is_object() {
            continue;
        }
        let raw: RawProjectStats = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(project = %project_path, error = %e, "Skipping stats entry");
                continue;
            }
        };
        stats.push(ProjectStats {
            project_path,
            total_tokens: raw.total_tokens,
            total_cost: raw.total_cost,
            last_model: raw.last_model.filter(|m| !m.is_empty()),
            message_count: raw.message_count,
            last_session_id: raw.last_session_id.filter(|s| !s.is_empty()),
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transcript_user_and_assistant() {
        let input = lines(&[
            r#"{"type":"user","sessionId":"abc","cwd":"/repo","timestamp":"2025-01-15T10:00:00.000Z","message":{"role":"user","content":"fix the bug"}}"#,
            r#"{"type":"assistant","sessionId":"abc","cwd":"/repo","timestamp":"2025-01-15T10:00:05.000Z","message":{"role":"assistant","model":"claude-sonnet-4-20250514","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Looking."},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/repo/a.rs"}}],"usage":{"input_tokens":100,"output_tokens":20}}}"#,
        ]);

        let deltas = TranscriptDecoder::new().decode(&input);
        let kinds: Vec<_> = deltas.iter().map(|d| &d.kind).collect();

        assert_eq!(
            kinds[0],
            &DeltaKind::Prompt {
                text: "fix the bug".to_string()
            }
        );
        assert!(matches!(kinds[1], DeltaKind::Model { model } if model == "claude-sonnet-4-20250514"));
        assert_eq!(kinds[2], &DeltaKind::Tokens { input: 100, output: 20 });
        assert!(matches!(kinds[3], DeltaKind::Thinking { .. }));
        assert!(matches!(kinds[4], DeltaKind::Response { .. }));
        assert!(matches!(kinds[5], DeltaKind::ToolUse { name, .. } if name == "Read"));
        assert_eq!(deltas.len(), 6);
        assert!(deltas.iter().all(|d| d.session_id.as_deref() == Some("abc")));
        assert_eq!(deltas[0].cwd.as_deref(), Some("/repo"));
        assert!(deltas[0].timestamp.is_some());
    }

    #[test]
    fn test_transcript_skips_noise() {
        let input = lines(&[
            "{not json",
            r#"{"type":"file-history-snapshot","snapshot":{}}"#,
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
            r#"{"type":"assistant","isSidechain":true,"message":{"role":"assistant","content":"side"}}"#,
        ]);
        assert!(TranscriptDecoder::new().decode(&input).is_empty());
    }

    #[test]
    fn test_transcript_inherits_file_session() {
        let input = lines(&[r#"{"type":"user","message":{"role":"user","content":"hi"}}"#]);
        let deltas = TranscriptDecoder::for_session("from-stem").decode(&input);
        assert_eq!(deltas[0].session_id.as_deref(), Some("from-stem"));
    }

    #[test]
    fn test_history_entries() {
        let line = r#"{"display":"add tests","timestamp":1736935200000,"project":"/repo","sessionId":"s-1"}"#;
        let entry = HistoryEntry::parse(line).unwrap();
        assert_eq!(entry.project, "/repo");
        assert_eq!(entry.session_id.as_deref(), Some("s-1"));
        assert_eq!(entry.timestamp.unwrap().timestamp_millis(), 1736935200000);

        assert!(HistoryEntry::parse(r#"{"display":"x"}"#).is_none());

        let deltas = HistoryDecoder::new().decode(&lines(&[line, "garbage"]));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].cwd.as_deref(), Some("/repo"));
    }

    #[test]
    fn test_stats_cache_shapes() {
        let content = r#"{
            "/repo": {"totalTokens": {"input": 10, "output": 20}, "totalCost": 0.5, "lastModel": "claude-opus-4-5-20251101", "lastSessionId": "s-9"},
            "/other": {"totalTokens": 1000, "messageCount": 7},
            "/": {"totalTokens": 5},
            "version": 2
        }"#;
        let mut stats = parse_stats_cache(content).unwrap();
        stats.sort_by(|a, b| a.project_path.cmp(&b.project_path));

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].project_path, "/other");
        assert_eq!(stats[0].total_tokens, Some(TokenTotals::Combined(1000)));
        assert_eq!(stats[0].message_count, Some(7));
        assert_eq!(
            stats[1].total_tokens,
            Some(TokenTotals::Split {
                input: 10,
                output: 20
            })
        );
        assert_eq!(stats[1].last_session_id.as_deref(), Some("s-9"));

        assert!(parse_stats_cache("[]").is_err());
    }
}
