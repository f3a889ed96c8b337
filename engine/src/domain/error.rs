//! Domain-level errors
//! These represent lifecycle rule violations and collaborator failures

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    // Registry-wide latches
    #[error("Host controller is already shut down")]
    HostAlreadyShutdown,

    // Lifecycle errors
    #[error("Server '{server}' is in state {current} while {required} is required")]
    InvalidStateTransition {
        server: String,
        current: String,
        required: String,
    },

    #[error("Server '{0}' was removed from the inventory")]
    ServerRetired(String),

    #[error("Server '{0}' has no management channel")]
    NotConnected(String),

    // Collaborator failures
    #[error("Process controller failure: {0}")]
    ProcessController(String),

    #[error("Management channel failure: {0}")]
    ManagementChannel(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Validation errors
    #[error("Invalid server name: {0}")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl DomainError {
    /// Wrap an I/O failure raised while talking to the process controller.
    pub fn process_controller(context: &str, err: impl std::fmt::Display) -> Self {
        DomainError::ProcessController(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
