//! Incremental file reading by byte offset
//!
//! Only complete, newline-terminated lines are returned. A partially written
//! trailing line stays unread until its newline arrives, so a writer caught
//! mid-record never yields a truncated JSON object.

use crate::error::Result;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Per-file read offsets owned by one adapter
#[derive(Debug, Default)]
pub struct FileTail {
    offsets: HashMap<PathBuf, u64>,
}

impl FileTail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset for a file, if it has been seen
    pub fn offset(&self, path: &Path) -> Option<u64> {
        self.offsets.get(path).copied()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.offsets.contains_key(path)
    }

    /// Start tracking a file at its current end, skipping existing content
    pub fn seek_to_end(&mut self, path: &Path) -> Result<u64> {
        let len = std::fs::metadata(path)?.len();
        self.offsets.insert(path.to_path_buf(), len);
        Ok(len)
    }

    /// Stop tracking a file
    pub fn forget(&mut self, path: &Path) {
        self.offsets.remove(path);
    }

    /// Read complete lines appended since the last call.
    ///
    /// Untracked files are read from the start. If the file shrank below the
    /// stored offset it was truncated or replaced, and reading restarts at 0.
    pub fn read_new_lines(&mut self, path: &Path) -> Result<Vec<String>> {
        let len = std::fs::metadata(path)?.len();
        let mut offset = self.offset(path).unwrap_or(0);

        if offset > len {
            tracing::debug!(
                path = %path.display(),
                offset,
                len,
                "File truncated, re-reading from start"
            );
            offset = 0;
        }

        if offset == len {
            self.offsets.insert(path.to_path_buf(), offset);
            return Ok(Vec::new());
        }

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            // No complete line yet
            self.offsets.insert(path.to_path_buf(), offset);
            return Ok(Vec::new());
        };

        let complete = &buf[..=last_newline];
        self.offsets
            .insert(path.to_path_buf(), offset + complete.len() as u64);

        let lines = complete
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
            .filter(|line| !line.trim().is_empty())
            .collect();

        Ok(lines)
    }
}

/// Bytes read per step when scanning a file backwards
const TAIL_CHUNK: u64 = 8 * 1024;

/// Read the last `n` non-empty lines of a file.
///
/// Reads backwards from the end, so only the tail of a large file is touched.
/// Invalid UTF-8 is replaced rather than ending the read.
pub fn read_last_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut start = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();

    // More than n segments means the first, possibly partial, one can be dropped
    while start > 0 && non_empty_segments(&buf) <= n {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        let mut chunk = vec![0u8; step as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let skip = usize::from(start > 0);
    let mut lines: Vec<String> = buf
        .split(|b| *b == b'\n')
        .skip(skip)
        .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
        .filter(|line| !line.trim().is_empty())
        .collect();

    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

fn non_empty_segments(buf: &[u8]) -> usize {
    buf.split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .count()
}
