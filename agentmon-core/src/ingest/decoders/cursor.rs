//! Cursor `main.log` decoder
//!
//! Cursor has no transcript. The only live signal is its Electron main log,
//! where document opens show up as lines mentioning `openTextDocument` or
//! `didOpen` together with a `file://` uri:
//!
//! ```text
//! 2025-01-15 10:00:00.123 [info] openTextDocument file:///home/me/app/src/main.ts
//! ```

use crate::ingest::{Decoder, Delta, DeltaKind};
use crate::types::FileOperation;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static RE_FILE_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r#"file://([^\s\]"']+)"#).unwrap());

/// Decode a `file://` uri path component into a filesystem path
pub fn decode_file_uri(uri: &str) -> String {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Decoder for Cursor's `logs/<session>/main.log`
#[derive(Debug, Default)]
pub struct CursorLogDecoder;

impl CursorLogDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for CursorLogDecoder {
    fn decode(&mut self, lines: &[String]) -> Vec<Delta> {
        lines
            .iter()
            .filter(|line| line.contains("openTextDocument") || line.contains("didOpen"))
            .filter_map(|line| {
                let caps = RE_FILE_URI.captures(line)?;
                let path = decode_file_uri(&caps[1]);
                Some(
                    Delta::new(DeltaKind::FileTouched {
                        path,
                        operation: FileOperation::Read,
                    })
                    .at(line_timestamp(line)),
                )
            })
            .collect()
    }
}

/// Leading `YYYY-MM-DD HH:MM:SS.mmm` stamp, read as UTC
fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let stamp = line.get(..23)?;
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.3f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_document_lines() {
        let lines = vec![
            "2025-01-15 10:00:00.123 [info] openTextDocument file:///home/me/my%20app/src/main.ts".to_string(),
            "2025-01-15 10:00:01.000 [info] window focused".to_string(),
            "[debug] didOpen \"file:///srv/api/lib.rs\"".to_string(),
            "openTextDocument untitled:Untitled-1".to_string(),
        ];

        let deltas = CursorLogDecoder::new().decode(&lines);
        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0].kind,
            DeltaKind::FileTouched {
                path: "/home/me/my app/src/main.ts".to_string(),
                operation: FileOperation::Read,
            }
        );
        assert!(deltas[0].timestamp.is_some());
        assert!(matches!(&deltas[1].kind, DeltaKind::FileTouched { path, .. } if path == "/srv/api/lib.rs"));
        assert!(deltas[1].timestamp.is_none());
    }

    #[test]
    fn test_decode_file_uri() {
        assert_eq!(decode_file_uri("file:///a/b%2Bc"), "/a/b+c");
        assert_eq!(decode_file_uri("/plain/path"), "/plain/path");
    }
}
