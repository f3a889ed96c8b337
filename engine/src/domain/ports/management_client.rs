//! ManagementClient port
//! Request/response client over the management channel a server opens once booted

use crate::domain::{DomainError, OperationResponse, ServerOperation};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Cancellable pending final result of a management operation
#[derive(Debug)]
pub struct OperationFuture {
    receiver: oneshot::Receiver<OperationResponse>,
    token: CancellationToken,
}

/// Producer side of an [`OperationFuture`], held by the channel implementation
#[derive(Debug)]
pub struct OperationCompleter {
    sender: oneshot::Sender<OperationResponse>,
    token: CancellationToken,
}

impl OperationFuture {
    pub fn channel() -> (Self, OperationCompleter) {
        let (sender, receiver) = oneshot::channel();
        let token = CancellationToken::new();
        (
            Self {
                receiver,
                token: token.clone(),
            },
            OperationCompleter { sender, token },
        )
    }

    /// A future that is already resolved
    pub fn ready(response: OperationResponse) -> Self {
        let (future, completer) = Self::channel();
        completer.complete(response);
        future
    }

    /// Ask the remote side to abandon the request
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the final response.
    ///
    /// On timeout the request is cancelled and `DomainError::Timeout` is
    /// returned. A completer dropped without answering yields
    /// `DomainError::ManagementChannel`.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<OperationResponse, DomainError> {
        let Self { receiver, token } = self;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    token.cancel();
                    return Err(DomainError::Timeout(format!(
                        "no response after {}s",
                        limit.as_secs()
                    )));
                }
            },
            None => receiver.await,
        };

        received.map_err(|_| DomainError::ManagementChannel("operation abandoned".to_string()))
    }
}

impl OperationCompleter {
    /// Deliver the final response. Returns false when the waiter is gone.
    pub fn complete(self, response: OperationResponse) -> bool {
        self.sender.send(response).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the waiter cancelled the request
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Result of the prepare phase of a management operation.
///
/// The caller must `commit` or `rollback`; both hand back the pending final
/// result.
#[derive(Debug)]
pub struct PreparedOperation {
    prepared: OperationResponse,
    decision: Option<oneshot::Sender<bool>>,
    result: OperationFuture,
}

impl PreparedOperation {
    pub fn new(
        prepared: OperationResponse,
        decision: oneshot::Sender<bool>,
        result: OperationFuture,
    ) -> Self {
        Self {
            prepared,
            decision: Some(decision),
            result,
        }
    }

    /// An operation that needs no decision: prepare and final outcome are the same
    pub fn completed(response: OperationResponse) -> Self {
        Self {
            result: OperationFuture::ready(response.clone()),
            prepared: response,
            decision: None,
        }
    }

    pub fn prepared_response(&self) -> &OperationResponse {
        &self.prepared
    }

    pub fn is_failed(&self) -> bool {
        !self.prepared.is_success()
    }

    pub fn commit(mut self) -> OperationFuture {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(true);
        }
        self.result
    }

    pub fn rollback(mut self) -> OperationFuture {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(false);
        }
        self.result
    }
}

/// Port for a connected server's management channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Execute an operation against the root of the server's model
    async fn execute(&self, operation: ServerOperation) -> Result<PreparedOperation, DomainError>;
}

/// How [`StaticManagementClient`] answers every request
#[derive(Debug, Clone, PartialEq)]
pub enum StaticReply {
    /// Prepare and complete with the given response
    Complete(OperationResponse),
    /// Prepare succeeds, the final response never arrives
    Hang,
    /// Prepare succeeds, then the channel drops the request unanswered
    Abandon,
    /// Fail the dispatch itself
    Reject(String),
}

/// In-memory management channel that answers every operation the same way
pub struct StaticManagementClient {
    reply: Mutex<StaticReply>,
    executed: Mutex<Vec<ServerOperation>>,
    /// Cancellation tokens of every pending result handed out
    issued: Mutex<Vec<CancellationToken>>,
    hanging: Mutex<Vec<OperationCompleter>>,
}

impl StaticManagementClient {
    pub fn new(reply: StaticReply) -> Self {
        Self {
            reply: Mutex::new(reply),
            executed: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
            hanging: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(StaticReply::Complete(OperationResponse::success()))
    }

    pub fn set_reply(&self, reply: StaticReply) {
        *self.reply.lock().unwrap_or_else(PoisonError::into_inner) = reply;
    }

    /// Operations executed so far, in order
    pub fn executed(&self) -> Vec<ServerOperation> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests the caller has cancelled, whatever their reply
    pub fn cancelled_count(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|token| token.is_cancelled())
            .count()
    }

    fn issue(&self, prepared: OperationResponse) -> (PreparedOperation, OperationCompleter) {
        let (result, completer) = OperationFuture::channel();
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(completer.token.clone());
        let prepared = PreparedOperation {
            prepared,
            decision: None,
            result,
        };
        (prepared, completer)
    }
}

impl Default for StaticManagementClient {
    fn default() -> Self {
        Self::succeeding()
    }
}

#[async_trait]
impl ManagementClient for StaticManagementClient {
    async fn execute(&self, operation: ServerOperation) -> Result<PreparedOperation, DomainError> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation);

        let reply = self
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match reply {
            StaticReply::Complete(response) => {
                let (prepared, completer) = self.issue(response.clone());
                completer.complete(response);
                Ok(prepared)
            }
            StaticReply::Hang => {
                let (prepared, completer) = self.issue(OperationResponse::success());
                self.hanging
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(completer);
                Ok(prepared)
            }
            StaticReply::Abandon => {
                let (prepared, completer) = self.issue(OperationResponse::success());
                drop(completer);
                Ok(prepared)
            }
            StaticReply::Reject(reason) => Err(DomainError::ManagementChannel(reason)),
        }
    }
}
