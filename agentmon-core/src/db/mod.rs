//! Database layer for agentmon
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - The session store (upserts, event log, dedup and stale sweeps)
//! - Hourly metric rollups

pub mod repo;
pub mod schema;

pub use repo::{Database, SessionFilter};
