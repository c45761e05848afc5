//! Ingestion layer: tailing source files and decoding them into deltas
//!
//! Adapters never parse tool-specific syntax themselves. They read newly
//! appended lines through a [`FileTail`] and hand them to a [`Decoder`],
//! which turns them into normalized [`Delta`]s the reconciliation engine
//! understands.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────┐     ┌─────────┐
//! │  Source Files   │ ──► │   FileTail   │ ──► │  Decoder  │ ──► │ Adapter │
//! │ (~/.claude/...) │     │ (byte offset)│     │  (Delta)  │     │ (merge) │
//! └─────────────────┘     └──────────────┘     └───────────┘     └─────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agentmon_core::ingest::{Decoder, FileTail};
//! use agentmon_core::ingest::decoders::AiderDecoder;
//!
//! let mut tail = FileTail::new();
//! let mut decoder = AiderDecoder::new();
//! let lines = tail.read_new_lines(&path)?;
//! for delta in decoder.decode(&lines) {
//!     println!("{:?}", delta.kind);
//! }
//! ```

pub mod decoders;
mod tail;

pub use tail::{read_last_lines, FileTail};

use crate::types::FileOperation;
use chrono::{DateTime, TimeZone, Utc};

/// What a decoded line says happened
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaKind {
    /// The user sent a message
    Prompt { text: String },
    /// The assistant produced visible text
    Response { text: String },
    /// Extended thinking block
    Thinking { text: String },
    /// A tool was invoked
    ToolUse {
        name: String,
        input: Option<serde_json::Value>,
    },
    /// A file was opened or changed
    FileTouched {
        path: String,
        operation: FileOperation,
    },
    /// Token usage for one exchange
    Tokens { input: i64, output: i64 },
    /// Reported spend. `amount` is the per-message figure, `session_total` the
    /// running total when the source prints one.
    Cost {
        amount: f64,
        session_total: Option<f64>,
    },
    /// The model in use
    Model { model: String },
    /// A named, source-defined event
    Custom { name: String, text: String },
}

/// One normalized observation produced by a [`Decoder`]
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Tool-scoped session id carried by the line, if any
    pub session_id: Option<String>,
    /// Working directory carried by the line, if any
    pub cwd: Option<String>,
    /// When the source says it happened
    pub timestamp: Option<DateTime<Utc>>,
    /// Original record, kept as event `raw_data`
    pub raw: Option<serde_json::Value>,
}

impl Delta {
    pub fn new(kind: DeltaKind) -> Self {
        Self {
            kind,
            session_id: None,
            cwd: None,
            timestamp: None,
            raw: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id.filter(|s| !s.is_empty());
        self
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd.filter(|s| !s.is_empty());
        self
    }

    pub fn at(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Turns raw lines from one known file format into deltas.
///
/// Decoders are lenient: lines they cannot understand are skipped (and
/// logged at debug level), never reported as errors.
pub trait Decoder: Send {
    /// Decode a batch of complete lines, in file order
    fn decode(&mut self, lines: &[String]) -> Vec<Delta>;
}

/// Parse an RFC 3339 timestamp string
pub(crate) fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a Unix timestamp in milliseconds
pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
