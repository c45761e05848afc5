//! # agentmon-core
//!
//! Core library for agentmon - a monitor for AI coding agents.
//!
//! This library provides:
//! - Domain types for sessions, events and rollups
//! - Database storage layer with SQLite
//! - Source adapters for Claude Code, Aider, Cursor and manifest-described tools
//! - A bounded event bus and the daemon that drives everything
//! - The newline-delimited JSON protocol spoken over the daemon socket
//!
//! ## Architecture
//!
//! ```text
//! processes ─┐
//! files ─────┼─► adapters ─► reconcile ─► Database
//! hooks ─────┘                  │
//!                               └─► EventBus ─► subscribers
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use agentmon_core::{Config, Daemon, Database, Request};
//! use std::sync::Arc;
//!
//! # async fn run() -> agentmon_core::Result<()> {
//! let config = Config::load()?;
//! let db = Arc::new(Database::open(&Config::database_path())?);
//! let daemon = Daemon::start(config, db).await?;
//! let status = daemon.handle_request(Request::GetStatus).await;
//! println!("{:?}", status.get("state"));
//! daemon.stop().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use adapters::{Adapter, AdapterContext, AdapterManifest, HookKind, HookPayload};
pub use bus::{EventBus, EventFilter, SubscriptionId};
pub use config::Config;
pub use daemon::{Daemon, MaintenanceReport};
pub use db::{Database, SessionFilter};
pub use error::{Error, Result};
pub use ipc::{Request, Response};
pub use pricing::PricingTable;
pub use process::{ProcessInfo, ProcessSource, StaticProcesses, SystemProcesses};
pub use types::*;

// Public modules
pub mod adapters;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod ingest;
pub mod ipc;
pub mod logging;
pub mod pricing;
pub mod process;
pub mod types;
pub mod watch;
