//! Format decoders, one module per tool
//!
//! | Tool | Module | Source |
//! |------|--------|--------|
//! | Claude Code | [`claude`] | transcripts, `history.jsonl`, `stats-cache.json` |
//! | Aider | [`aider`] | `.aider.chat.history.md` |
//! | Cursor | [`cursor`] | `logs/**/main.log` |
//! | Manifest tools | [`manifest`] | plain or JSON-lines logs |

pub mod aider;
pub mod claude;
pub mod cursor;
pub mod manifest;

pub use aider::AiderDecoder;
pub use claude::{
    parse_stats_cache, HistoryDecoder, HistoryEntry, ProjectStats, TokenTotals, TranscriptDecoder,
};
pub use cursor::{decode_file_uri, CursorLogDecoder};
pub use manifest::{LogFormat, PatternDecoder};
