//! Boot configuration value objects
//! How a server process is launched and what it is told on stdin once running

use crate::domain::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Launch parameters of a server process, replaced on every start or reconnect
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerBootConfiguration {
    /// Executable followed by its arguments
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Boot the server in suspended mode
    pub suspend: bool,
    /// Graceful shutdown timeout used when a stop request names none
    #[serde(default)]
    pub graceful_timeout: Option<Duration>,
}

impl ServerBootConfiguration {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_suspend(mut self, suspend: bool) -> Self {
        self.suspend = suspend;
        self
    }

    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(DomainError::InvalidConfiguration(
                "command must name an executable".to_string(),
            )),
        }
    }
}

/// Descriptor written to the stdin of a freshly started server process.
///
/// The server uses it to identify itself and authenticate when it opens
/// its management channel back to the host controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootDescriptor {
    pub server_name: String,
    pub auth_token: String,
    pub suspend: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub callback_address: Option<String>,
}

impl BootDescriptor {
    /// Encode as a single JSON line
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)
            .map_err(|e| DomainError::InvalidConfiguration(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_program() {
        assert!(ServerBootConfiguration::default().validate().is_err());
        assert!(
            ServerBootConfiguration::new(vec!["  ".to_string()])
                .validate()
                .is_err()
        );
        assert!(
            ServerBootConfiguration::new(vec!["/usr/bin/server".to_string()])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_builder() {
        let boot = ServerBootConfiguration::new(vec!["srv".to_string()])
            .with_working_dir("/tmp")
            .with_env("MODE", "fast")
            .with_suspend(true);
        assert_eq!(boot.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(boot.env.get("MODE").map(String::as_str), Some("fast"));
        assert!(boot.suspend);
    }

    #[test]
    fn test_descriptor_line() {
        let descriptor = BootDescriptor {
            server_name: "server-one".to_string(),
            auth_token: "abc".to_string(),
            suspend: false,
            callback_address: None,
        };
        let line = descriptor.to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["server_name"], "server-one");
        assert_eq!(value["auth_token"], "abc");
        assert!(value.get("callback_address").is_none());
    }
}
