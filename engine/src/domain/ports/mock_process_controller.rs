//! Mock process controller for testing
//! Records every request and, when wired to an event channel, answers with
//! the notifications a well-behaved supervisor would send

use crate::domain::{DomainError, ProcessInfo};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::UnboundedSender;

use super::{AddProcessRequest, ProcessControllerClient, ProcessEvent, ProcessOperation, StdinSink};

/// A request received by [`MockProcessController`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    Add(AddProcessRequest),
    Start(String),
    SendStdin(String),
    Stop(String),
    Destroy(String),
    Kill(String),
    Remove(String),
    Reconnect { process_name: String, auth_token: String },
    RequestInventory,
}

impl ControllerCall {
    pub fn process_name(&self) -> Option<&str> {
        match self {
            ControllerCall::Add(request) => Some(&request.process_name),
            ControllerCall::Start(name)
            | ControllerCall::SendStdin(name)
            | ControllerCall::Stop(name)
            | ControllerCall::Destroy(name)
            | ControllerCall::Kill(name)
            | ControllerCall::Remove(name) => Some(name),
            ControllerCall::Reconnect { process_name, .. } => Some(process_name),
            ControllerCall::RequestInventory => None,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<ControllerCall>,
    failing: HashSet<ProcessOperation>,
    stdin: HashMap<String, Arc<Mutex<Vec<u8>>>>,
    inventory: HashMap<String, ProcessInfo>,
}

/// In-memory process controller
#[derive(Clone, Default)]
pub struct MockProcessController {
    state: Arc<Mutex<MockState>>,
    events: Option<UnboundedSender<ProcessEvent>>,
}

impl MockProcessController {
    /// Record requests only; notifications are delivered by the test
    pub fn new() -> Self {
        Self::default()
    }

    /// Record requests and emit the matching success notification for each
    pub fn with_events(events: UnboundedSender<ProcessEvent>) -> Self {
        Self {
            state: Arc::default(),
            events: Some(events),
        }
    }

    /// Make every request of this kind fail until cleared
    pub fn fail(&self, operation: ProcessOperation) {
        self.lock().failing.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn set_inventory(&self, inventory: Vec<ProcessInfo>) {
        self.lock().inventory = inventory
            .into_iter()
            .map(|info| (info.process_name.clone(), info))
            .collect();
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.lock().calls.clone()
    }

    /// Requests concerning one process, in order
    pub fn calls_for(&self, process_name: &str) -> Vec<ControllerCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.process_name() == Some(process_name))
            .cloned()
            .collect()
    }

    /// Everything written to the stdin of a process so far
    pub fn stdin_of(&self, process_name: &str) -> Vec<u8> {
        self.lock()
            .stdin
            .get(process_name)
            .map(|buffer| buffer.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(
        &self,
        call: ControllerCall,
        operation: Option<ProcessOperation>,
    ) -> Result<(), DomainError> {
        let mut state = self.lock();
        state.calls.push(call.clone());
        match operation {
            Some(op) if state.failing.contains(&op) => Err(DomainError::ProcessController(
                format!("{op} rejected for {}", call.process_name().unwrap_or("-")),
            )),
            _ => Ok(()),
        }
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl ProcessControllerClient for MockProcessController {
    async fn add_process(&self, request: AddProcessRequest) -> Result<(), DomainError> {
        let process_name = request.process_name.clone();
        self.record(ControllerCall::Add(request), Some(ProcessOperation::Add))?;
        self.emit(ProcessEvent::Added { process_name });
        Ok(())
    }

    async fn start_process(&self, process_name: &str) -> Result<(), DomainError> {
        self.record(
            ControllerCall::Start(process_name.to_string()),
            Some(ProcessOperation::Start),
        )?;
        self.emit(ProcessEvent::Started {
            process_name: process_name.to_string(),
        });
        Ok(())
    }

    async fn send_stdin(&self, process_name: &str) -> Result<StdinSink, DomainError> {
        self.record(
            ControllerCall::SendStdin(process_name.to_string()),
            Some(ProcessOperation::SendStdin),
        )?;
        let buffer = Arc::new(Mutex::new(Vec::new()));
        self.lock()
            .stdin
            .insert(process_name.to_string(), buffer.clone());
        Ok(Box::pin(RecordingSink { buffer }))
    }

    async fn stop_process(&self, process_name: &str) -> Result<(), DomainError> {
        self.record(
            ControllerCall::Stop(process_name.to_string()),
            Some(ProcessOperation::Stop),
        )?;
        self.emit(ProcessEvent::Stopped {
            process_name: process_name.to_string(),
            uptime: Duration::from_secs(60),
        });
        Ok(())
    }

    async fn destroy_process(&self, process_name: &str) -> Result<(), DomainError> {
        self.record(ControllerCall::Destroy(process_name.to_string()), None)
    }

    async fn kill_process(&self, process_name: &str) -> Result<(), DomainError> {
        self.record(ControllerCall::Kill(process_name.to_string()), None)
    }

    async fn remove_process(&self, process_name: &str) -> Result<(), DomainError> {
        self.record(
            ControllerCall::Remove(process_name.to_string()),
            Some(ProcessOperation::Remove),
        )?;
        self.emit(ProcessEvent::Removed {
            process_name: process_name.to_string(),
        });
        Ok(())
    }

    async fn reconnect_process(
        &self,
        process_name: &str,
        auth_token: &str,
    ) -> Result<(), DomainError> {
        self.record(
            ControllerCall::Reconnect {
                process_name: process_name.to_string(),
                auth_token: auth_token.to_string(),
            },
            Some(ProcessOperation::Reconnect),
        )
    }

    async fn request_process_inventory(&self) -> Result<(), DomainError> {
        self.record(ControllerCall::RequestInventory, None)?;
        let inventory = self.lock().inventory.clone();
        self.emit(ProcessEvent::Inventory(inventory));
        Ok(())
    }
}

/// Stdin sink that appends to a shared buffer
struct RecordingSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for RecordingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
