//! ProcessControllerClient port
//! Interface to the process supervisor that spawns and kills server processes

use crate::domain::{DomainError, ProcessInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Writable stdin of a started process
pub type StdinSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Registration of a new process with the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddProcessRequest {
    pub process_name: String,
    /// Numeric id of the server, stable for the server's lifetime in the registry
    pub process_id: u32,
    /// Executable followed by its arguments
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Supervisor request kinds, used to report asynchronous failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessOperation {
    Add,
    Start,
    Stop,
    SendStdin,
    Reconnect,
    Remove,
}

impl fmt::Display for ProcessOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOperation::Add => write!(f, "add"),
            ProcessOperation::Start => write!(f, "start"),
            ProcessOperation::Stop => write!(f, "stop"),
            ProcessOperation::SendStdin => write!(f, "send-stdin"),
            ProcessOperation::Reconnect => write!(f, "reconnect"),
            ProcessOperation::Remove => write!(f, "remove"),
        }
    }
}

/// Notification emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Added { process_name: String },
    Started { process_name: String },
    Stopped { process_name: String, uptime: Duration },
    Removed { process_name: String },
    OperationFailed {
        process_name: String,
        operation: ProcessOperation,
    },
    /// The process keeps exiting shortly after start
    Unstable { process_name: String },
    Inventory(HashMap<String, ProcessInfo>),
}

/// Port for the process supervisor.
///
/// Every request is fire-and-forget from the caller's point of view: success
/// only means the request was accepted. The outcome arrives later as a
/// [`ProcessEvent`].
#[async_trait]
pub trait ProcessControllerClient: Send + Sync {
    async fn add_process(&self, request: AddProcessRequest) -> Result<(), DomainError>;

    async fn start_process(&self, process_name: &str) -> Result<(), DomainError>;

    /// Open the stdin of a started process
    async fn send_stdin(&self, process_name: &str) -> Result<StdinSink, DomainError>;

    /// Request an orderly stop (SIGTERM)
    async fn stop_process(&self, process_name: &str) -> Result<(), DomainError>;

    /// Stop, escalating to a forced kill after a grace period
    async fn destroy_process(&self, process_name: &str) -> Result<(), DomainError>;

    /// Forced kill (SIGKILL)
    async fn kill_process(&self, process_name: &str) -> Result<(), DomainError>;

    async fn remove_process(&self, process_name: &str) -> Result<(), DomainError>;

    /// Hand a fresh auth token to a process adopted after a controller restart
    async fn reconnect_process(&self, process_name: &str, auth_token: &str)
    -> Result<(), DomainError>;

    /// Ask for a [`ProcessEvent::Inventory`] snapshot
    async fn request_process_inventory(&self) -> Result<(), DomainError>;
}
