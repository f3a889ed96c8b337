//! Server configuration files
//!
//! One YAML file per server in a directory; the server name is the file stem.

use crate::domain::{ServerBootConfiguration, validate_server_name};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Time the server gets to shut down on its own before being stopped
    pub graceful_timeout_sec: Option<u64>,
    /// Boot in suspended mode
    #[serde(default)]
    pub suspend: bool,
}

impl ServerConfig {
    pub fn graceful_timeout(&self) -> Option<Duration> {
        self.graceful_timeout_sec.map(Duration::from_secs)
    }

    pub fn boot_configuration(&self) -> ServerBootConfiguration {
        let mut command = Vec::with_capacity(self.args.len() + 1);
        command.push(self.command.clone());
        command.extend(self.args.iter().cloned());

        ServerBootConfiguration {
            command,
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            suspend: self.suspend,
            graceful_timeout: self.graceful_timeout(),
        }
    }
}

/// Scan a directory for `*.yaml` / `*.yml` files, sorted by name.
/// Files that fail to parse or carry an invalid server name are logged and skipped.
pub fn load_server_configs(dir: &Path) -> Result<Vec<(String, ServerConfig)>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read config directory: {}", dir.display()))?;

    let mut yaml_files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|path| {
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                debug!(path = %path.display(), "skipping non-YAML file");
            }
            is_yaml
        })
        .collect();
    yaml_files.sort();

    let mut configs = Vec::new();
    for path in yaml_files {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!(path = %path.display(), "skipping file with non UTF-8 name");
            continue;
        };
        if let Err(e) = validate_server_name(name) {
            warn!(path = %path.display(), error = %e, "skipping config");
            continue;
        }

        match parse_server_config(&path) {
            Ok(config) => configs.push((name.to_string(), config)),
            Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "skipping config"),
        }
    }

    Ok(configs)
}

fn parse_server_config(path: &Path) -> Result<ServerConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: ServerConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    config
        .boot_configuration()
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}
