//! Configuration loading and config file resolution
//!
//! Bootstrap settings come from a TOML file. Every section and every field is
//! optional; missing values fall back to built-in defaults. Command-line
//! arguments and environment variables override the file in the binary.
//!
//! # Config file resolution
//!
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. `~/.config/clientsync/config.toml`
//! 4. `/etc/clientsync/config.toml` (Linux only)
//!
//! When none exists the defaults are used as-is.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CLIENTSYNC_CONFIG";

/// Complete bootstrap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and change-store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite URL of the store the change detector scans
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_url: None,
        }
    }
}

/// Identity key resolution rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Record ids known to describe one prospect despite inconsistent contact fields
    #[serde(default = "default_shared_ids")]
    pub shared_ids: Vec<String>,
    /// Local parts that mark a shared inbox (`prospects@...`)
    #[serde(default = "default_generic_local_parts")]
    pub generic_local_parts: Vec<String>,
    /// Full addresses treated as shared inboxes regardless of local part
    #[serde(default)]
    pub generic_addresses: Vec<String>,
    /// Display mailbox for shared-identifier groups
    #[serde(default = "default_shared_mailbox")]
    pub shared_mailbox: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            shared_ids: default_shared_ids(),
            generic_local_parts: default_generic_local_parts(),
            generic_addresses: Vec::new(),
            shared_mailbox: default_shared_mailbox(),
        }
    }
}

/// Display-level dedup policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Source tag preferred when ownership and status tie
    #[serde(default = "default_preferred_source")]
    pub preferred_source: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            preferred_source: default_preferred_source(),
        }
    }
}

/// Change detector timing and source table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Look-back window seeding the first poll
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_claims_table")]
    pub table: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            safety_margin_secs: default_safety_margin_secs(),
            table: default_claims_table(),
        }
    }
}

/// Broadcast hub connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Reconnect hint sent to clients on open
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    /// Per-connection frame buffer; a full buffer counts as a failed write
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            retry_ms: default_retry_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Aggregate view cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Wildcard prefixes evicted after every claim
    #[serde(default = "default_invalidate_patterns")]
    pub invalidate_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            invalidate_patterns: default_invalidate_patterns(),
        }
    }
}

/// External claim collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    /// Endpoint receiving claim requests; claims are rejected when unset
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default = "default_claim_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            timeout_secs: default_claim_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5790
}

fn default_shared_ids() -> Vec<String> {
    vec!["28609".to_string()]
}

fn default_generic_local_parts() -> Vec<String> {
    [
        "prospects",
        "enquiries",
        "enquiry",
        "info",
        "hello",
        "team",
        "sales",
        "admin",
        "office",
        "contact",
        "noreply",
        "no-reply",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_shared_mailbox() -> String {
    "prospects@helix.example".to_string()
}

fn default_preferred_source() -> String {
    "v2".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_safety_margin_secs() -> u64 {
    60
}

fn default_claims_table() -> String {
    "claims".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_retry_ms() -> u64 {
    10_000
}

fn default_channel_capacity() -> usize {
    64
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_invalidate_patterns() -> Vec<String> {
    vec!["clients:*".to_string(), "enquiries:*".to_string()]
}

fn default_claim_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve which config file to read, if any
///
/// An explicitly named file (CLI or environment) must exist; the default
/// locations are only used when present.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Result<Option<PathBuf>> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return explicit(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return explicit(PathBuf::from(path));
        }
    }

    // Priority 3/4: platform locations
    Ok(default_config_locations().into_iter().find(|p| p.exists()))
}

fn explicit(path: PathBuf) -> Result<Option<PathBuf>> {
    if path.exists() {
        Ok(Some(path))
    } else {
        Err(Error::Config(format!("Config file not found: {}", path.display())))
    }
}

fn default_config_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        locations.push(dir.join("clientsync").join("config.toml"));
    }
    if cfg!(target_os = "linux") {
        locations.push(PathBuf::from("/etc/clientsync/config.toml"));
    }
    locations
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    debug!("Parsed config file {}", path.display());
    Ok(config)
}

/// Load the resolved config file, or built-in defaults when there is none
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg)? {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        None => {
            info!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}
