//! Management operations sent to a running server over its management channel

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;

/// Operation executed against the root of a server's management model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerOperation {
    /// Reload the server in place. `permit` identifies the reload attempt.
    Reload { permit: u32, suspend: bool },

    /// Stop accepting new work, waiting up to `timeout_secs` for active work
    Suspend { timeout_secs: Option<u64> },

    Resume,

    /// Graceful shutdown, waiting up to `timeout_secs` for active work
    Shutdown { timeout_secs: u64 },
}

impl ServerOperation {
    pub fn suspend(timeout: Option<Duration>) -> Self {
        ServerOperation::Suspend {
            timeout_secs: timeout.map(|t| t.as_secs()),
        }
    }

    pub fn shutdown(timeout: Duration) -> Self {
        ServerOperation::Shutdown {
            timeout_secs: timeout.as_secs(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerOperation::Reload { .. } => "reload-servers",
            ServerOperation::Suspend { .. } => "suspend",
            ServerOperation::Resume => "resume",
            ServerOperation::Shutdown { .. } => "shutdown",
        }
    }

    /// Render as a request addressed to the model root
    pub fn to_request(&self) -> Value {
        let mut request = json!({
            "operation": self.name(),
            "address": [],
        });
        match self {
            ServerOperation::Reload { permit, suspend } => {
                request["operation-id"] = json!(permit);
                if *suspend {
                    request["suspend"] = json!(true);
                }
            }
            ServerOperation::Suspend {
                timeout_secs: Some(secs),
            } => {
                request["timeout"] = json!(secs);
            }
            ServerOperation::Shutdown { timeout_secs } => {
                request["timeout"] = json!(timeout_secs);
            }
            _ => {}
        }
        request
    }
}

impl fmt::Display for ServerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome reported by a server for a management operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failed { description: String },
}

/// Final response of a management operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub outcome: Outcome,
    #[serde(default)]
    pub result: Value,
}

impl OperationResponse {
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            result: Value::Null,
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed {
                description: description.into(),
            },
            result: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn failure_description(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failed { description } => Some(description),
            Outcome::Success => None,
        }
    }
}
