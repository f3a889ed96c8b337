//! ServerStatus value object
//! Coarse, caller-facing view of a managed server

use super::InternalState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status reported to callers of the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServerStatus {
    /// Not running and not requested to run
    #[default]
    Stopped,

    /// Requested to run, not yet fully booted
    Starting,

    /// Booted and reachable
    Started,

    /// Requested to stop, teardown in progress
    Stopping,

    /// A start or stop failed and needs an explicit request to recover
    Failed,
}

impl ServerStatus {
    /// Derive the status from the `(internal, required)` pair of a tracked server
    pub fn from_states(internal: InternalState, required: InternalState) -> Self {
        match required {
            InternalState::Failed => ServerStatus::Failed,
            InternalState::ServerStarted => {
                if internal == InternalState::ServerStarted {
                    ServerStatus::Started
                } else {
                    ServerStatus::Starting
                }
            }
            _ => {
                if internal == InternalState::Stopped {
                    ServerStatus::Stopped
                } else {
                    ServerStatus::Stopping
                }
            }
        }
    }

    /// Whether the status no longer moves without a new request
    pub fn is_settled(&self) -> bool {
        matches!(self, ServerStatus::Stopped | ServerStatus::Failed)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Starting => write!(f, "starting"),
            ServerStatus::Started => write!(f, "started"),
            ServerStatus::Stopping => write!(f, "stopping"),
            ServerStatus::Failed => write!(f, "failed"),
        }
    }
}
