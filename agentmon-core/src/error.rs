//! Error types for agentmon-core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the agentmon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transient failure reading a tool's files or process table
    #[error("parse error in {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Adapter manifest could not be loaded
    #[error("invalid manifest {path:?}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A hand-built record is missing required fields
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// File notification backend error
    #[error("watch error: {0}")]
    Watch(String),

    /// IPC transport or protocol error
    #[error("IPC error: {0}")]
    Ipc(String),
}

impl Error {
    /// Build a [`Error::Parse`] for the named source
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for agentmon-core
pub type Result<T> = std::result::Result<T, Error>;
