//! Daemon configuration from environment variables
//!
//! All configuration is read from environment variables with sensible defaults.

use hc_engine::domain::InventorySettings;
use hc_engine::domain::constants::{DEFAULT_BLOCKING_TIMEOUT_SEC, DEFAULT_INVENTORY_TIMEOUT_SEC};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_DIR: &str = "/etc/host-controller/servers.d";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Daemon configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Directory holding one YAML file per server
    pub config_dir: PathBuf,

    /// Log filter directive
    pub log_level: String,

    /// Extra time fleet-wide callers wait on each server
    pub blocking_timeout_sec: u64,

    /// Graceful shutdown timeout for servers stopped without an explicit one
    pub graceful_timeout_sec: Option<u64>,

    /// Address servers call back to when opening their management channel
    pub callback_address: Option<String>,
}

impl DaemonConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            config_dir: env::var("HC_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR)),
            log_level: Self::parse_log_level(),
            blocking_timeout_sec: Self::parse_u64("HC_BLOCKING_TIMEOUT_SEC")
                .unwrap_or(DEFAULT_BLOCKING_TIMEOUT_SEC),
            graceful_timeout_sec: Self::parse_u64("HC_GRACEFUL_TIMEOUT_SEC"),
            callback_address: env::var("HC_CALLBACK_ADDRESS").ok(),
        }
    }

    fn parse_u64(var_name: &str) -> Option<u64> {
        env::var(var_name).ok().and_then(|s| s.trim().parse().ok())
    }

    fn parse_log_level() -> String {
        // Priority: HC_LOG_LEVEL > RUST_LOG > default
        env::var("HC_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.blocking_timeout_sec == 0 {
            return Err("HC_BLOCKING_TIMEOUT_SEC must be greater than zero".to_string());
        }
        if let Some(address) = &self.callback_address
            && address.trim().is_empty()
        {
            return Err("HC_CALLBACK_ADDRESS must not be empty".to_string());
        }
        Ok(())
    }

    pub fn inventory_settings(&self) -> InventorySettings {
        InventorySettings {
            blocking_timeout: Duration::from_secs(self.blocking_timeout_sec),
            inventory_timeout: Duration::from_secs(DEFAULT_INVENTORY_TIMEOUT_SEC),
            default_graceful_timeout: self.graceful_timeout_sec.map(Duration::from_secs),
            callback_address: self.callback_address.clone(),
        }
    }
}
