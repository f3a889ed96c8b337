//! Process naming and inventory entries

use crate::domain::constants::SERVER_PROCESS_PREFIX;
use crate::domain::{DomainError, Result};
use serde::{Deserialize, Serialize};

/// Name the process controller knows a server's process by
pub fn server_process_name(server_name: &str) -> String {
    format!("{SERVER_PROCESS_PREFIX}{server_name}")
}

pub fn is_server_process(process_name: &str) -> bool {
    process_name.starts_with(SERVER_PROCESS_PREFIX)
}

/// Recover the server name from a process name, if it names a server process
pub fn server_name_of(process_name: &str) -> Option<&str> {
    process_name
        .strip_prefix(SERVER_PROCESS_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Reject names that cannot be used as server identifiers
pub fn validate_server_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DomainError::InvalidName("server name is empty".to_string()));
    }
    if name.chars().any(|c| c.is_control() || c == '/') {
        return Err(DomainError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// One entry of the process controller's inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_name: String,
    pub running: bool,
    /// The process controller has been asked to stop it
    pub stopping: bool,
}

impl ProcessInfo {
    pub fn server_name(&self) -> Option<&str> {
        server_name_of(&self.process_name)
    }
}
