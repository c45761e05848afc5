//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/agentmon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/agentmon/` (~/.config/agentmon/)
//! - Data: `$XDG_DATA_HOME/agentmon/` (~/.local/share/agentmon/)
//! - State/Logs/Socket: `$XDG_STATE_HOME/agentmon/` (~/.local/state/agentmon/)

use crate::error::{Error, Result};
use crate::pricing::{ModelPrice, PricingTable};
use crate::types::AgentType;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
pub(crate) fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Daemon loops, queue and IPC settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Claude Code adapter settings
    #[serde(default)]
    pub claude_code: ClaudeCodeConfig,

    /// Aider adapter settings
    #[serde(default)]
    pub aider: AiderConfig,

    /// Cursor adapter settings
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Model pricing overrides
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Seconds between adapter background ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds between full discovery passes driven by the daemon
    #[serde(default = "default_poll_interval")]
    pub discovery_interval_secs: u64,

    /// Bounded event bus capacity
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,

    /// IPC socket override
    pub socket_path: Option<PathBuf>,

    /// Adapters to start (`claude_code`, `aider`, `cursor`)
    #[serde(default = "default_enabled_adapters")]
    pub enabled_adapters: Vec<AgentType>,

    /// Merge monitoring hooks into the Claude settings on start
    #[serde(default)]
    pub auto_install_hooks: bool,

    /// Hours of inactivity before an ACTIVE session is considered stale
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: i64,

    /// Delete stale sessions instead of completing them
    #[serde(default)]
    pub delete_stale: bool,

    /// Seconds between dedup/stale/aggregation passes
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            discovery_interval_secs: default_poll_interval(),
            event_queue_size: default_event_queue_size(),
            socket_path: None,
            enabled_adapters: default_enabled_adapters(),
            auto_install_hooks: false,
            stale_after_hours: default_stale_after_hours(),
            delete_stale: false,
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_event_queue_size() -> usize {
    10_000
}

fn default_enabled_adapters() -> Vec<AgentType> {
    AgentType::builtin().to_vec()
}

fn default_stale_after_hours() -> i64 {
    24
}

fn default_maintenance_interval() -> u64 {
    3600
}

/// Claude Code adapter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ClaudeCodeConfig {
    /// Override for `~/.claude`
    pub home: Option<PathBuf>,

    /// Trailing history lines considered during discovery
    #[serde(default = "default_history_tail_lines")]
    pub history_tail_lines: usize,

    /// A history project counts as ACTIVE if touched within this window
    #[serde(default = "default_active_window_minutes")]
    pub active_window_minutes: i64,

    /// Input share applied when a snapshot only reports a combined token total.
    /// `None` keeps the total in metadata without touching the counters.
    #[serde(default = "default_combined_token_input_share")]
    pub combined_token_input_share: Option<f64>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            home: None,
            history_tail_lines: default_history_tail_lines(),
            active_window_minutes: default_active_window_minutes(),
            combined_token_input_share: default_combined_token_input_share(),
        }
    }
}

impl ClaudeCodeConfig {
    /// Resolved Claude data directory
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| home_dir().join(".claude"))
    }
}

fn default_history_tail_lines() -> usize {
    1000
}

fn default_active_window_minutes() -> i64 {
    30
}

fn default_combined_token_input_share() -> Option<f64> {
    Some(0.3)
}

/// How repeated `Cost: $X` lines combine
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CostPolicy {
    /// Add every reported amount
    #[default]
    Sum,
    /// Keep only the most recent amount
    Latest,
}

/// Aider adapter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AiderConfig {
    /// Roots searched for `.aider.chat.history.md`
    #[serde(default = "default_aider_search_dirs")]
    pub search_dirs: Vec<PathBuf>,

    /// Directory levels searched below each root
    #[serde(default = "default_aider_max_depth")]
    pub max_depth: usize,

    #[serde(default)]
    pub cost_policy: CostPolicy,
}

impl Default for AiderConfig {
    fn default() -> Self {
        Self {
            search_dirs: default_aider_search_dirs(),
            max_depth: default_aider_max_depth(),
            cost_policy: CostPolicy::default(),
        }
    }
}

fn default_aider_search_dirs() -> Vec<PathBuf> {
    let home = home_dir();
    ["projects", "code", "dev", "src", "Documents"]
        .iter()
        .map(|d| home.join(d))
        .collect()
}

fn default_aider_max_depth() -> usize {
    4
}

/// Cursor adapter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CursorConfig {
    /// Override for Cursor's user data directory
    pub state_dir: Option<PathBuf>,

    /// Files whose presence marks a project root
    #[serde(default = "default_project_markers")]
    pub project_markers: Vec<String>,

    /// Maximum parent directories walked looking for a marker
    #[serde(default = "default_max_walk_depth")]
    pub max_walk_depth: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            project_markers: default_project_markers(),
            max_walk_depth: default_max_walk_depth(),
        }
    }
}

impl CursorConfig {
    /// Resolved Cursor data directory
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        let home = home_dir();
        if cfg!(target_os = "macos") {
            home.join("Library/Application Support/Cursor")
        } else {
            xdg_config_home().join("Cursor")
        }
    }
}

fn default_project_markers() -> Vec<String> {
    [".git", "package.json", "Cargo.toml", "pyproject.toml", "go.mod"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_walk_depth() -> usize {
    10
}

/// Pricing overrides, USD per million tokens
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PricingConfig {
    /// Fallback price for unknown models
    pub default: Option<ModelPrice>,

    /// Per-model prices, merged over the built-in table
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
}

impl PricingConfig {
    /// Built-in table with overrides applied
    pub fn table(&self) -> PricingTable {
        let mut table = PricingTable::default();
        if let Some(default) = self.default {
            table.set_default(default);
        }
        for (model, price) in &self.models {
            table.insert(model, *price);
        }
        table
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.daemon.poll_interval_secs == 0
            || self.daemon.discovery_interval_secs == 0
            || self.daemon.maintenance_interval_secs == 0
        {
            return Err(Error::Config(
                "daemon intervals must be greater than zero".to_string(),
            ));
        }
        if self.daemon.event_queue_size == 0 {
            return Err(Error::Config(
                "daemon.event_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.daemon.stale_after_hours <= 0 {
            return Err(Error::Config(
                "daemon.stale_after_hours must be positive".to_string(),
            ));
        }
        if let Some(share) = self.claude_code.combined_token_input_share {
            if !(0.0..=1.0).contains(&share) {
                return Err(Error::Config(
                    "claude_code.combined_token_input_share must be within [0, 1]".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Socket the daemon listens on
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("agentmon.sock"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/agentmon/config.toml` (~/.config/agentmon/config.toml)
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Returns the config directory path
    pub fn config_dir() -> PathBuf {
        xdg_config_home().join("agentmon")
    }

    /// Directory holding adapter manifests (`*.toml`, `*.json`)
    pub fn manifests_dir() -> PathBuf {
        Self::config_dir().join("adapters")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/agentmon/` (~/.local/share/agentmon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("agentmon")
    }

    /// Returns the state directory path (for logs and the socket)
    ///
    /// `$XDG_STATE_HOME/agentmon/` (~/.local/state/agentmon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("agentmon")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/agentmon/agentmon.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("agentmon.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/agentmon/agentmon.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("agentmon.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.poll_interval_secs, 30);
        assert_eq!(config.daemon.event_queue_size, 10_000);
        assert_eq!(config.daemon.enabled_adapters.len(), 3);
        assert_eq!(config.claude_code.history_tail_lines, 1000);
        assert_eq!(config.claude_code.combined_token_input_share, Some(0.3));
        assert_eq!(config.aider.cost_policy, CostPolicy::Sum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[daemon]
poll_interval_secs = 5
enabled_adapters = ["claude_code"]
stale_after_hours = 6

[claude_code]
home = "/tmp/claude"

[aider]
cost_policy = "latest"
search_dirs = ["/srv/code"]

[pricing.models."my-model"]
input = 1.0
output = 2.0

[logging]
level = "debug"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.daemon.poll_interval_secs, 5);
        assert_eq!(config.daemon.enabled_adapters, vec![AgentType::ClaudeCode]);
        assert_eq!(config.claude_code.home_dir(), PathBuf::from("/tmp/claude"));
        assert_eq!(config.aider.cost_policy, CostPolicy::Latest);
        assert_eq!(config.aider.search_dirs, vec![PathBuf::from("/srv/code")]);
        assert_eq!(config.logging.level, "debug");

        let price = config.pricing.table().price_for(Some("my-model"));
        assert_eq!(price.input, 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.daemon.event_queue_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.claude_code.combined_token_input_share = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = Config::load_from(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
