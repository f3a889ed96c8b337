//! Transition tasks
//! The side effect run when a managed server enters an asynchronous state

use super::managed_server::{ManagedServer, ServerInner};
use crate::domain::constants::GRACEFUL_SHUTDOWN_MARGIN;
use crate::domain::ports::{AddProcessRequest, ManagementClient, OperationFuture};
use crate::domain::{BootDescriptor, DomainError, InternalState, Result, ServerOperation};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTask {
    AddProcess,
    StartProcess,
    /// Write the boot descriptor to the process stdin
    SendStdin,
    /// Hand a fresh auth token to an already running process
    Reconnect,
    /// Stop the server, optionally through a graceful shutdown operation first
    StopServer { graceful: Option<Duration> },
    RemoveProcess,
    Reload { permit: u32, suspend: bool },
}

impl TransitionTask {
    /// Default task for entering `target` from the transition table
    pub fn for_target(target: InternalState) -> Option<Self> {
        match target {
            InternalState::ProcessAdding => Some(TransitionTask::AddProcess),
            InternalState::ProcessStarting => Some(TransitionTask::StartProcess),
            InternalState::SendStdin => Some(TransitionTask::SendStdin),
            InternalState::ProcessStopping => Some(TransitionTask::StopServer { graceful: None }),
            InternalState::ProcessRemoving => Some(TransitionTask::RemoveProcess),
            _ => None,
        }
    }

    pub(super) async fn execute(
        &self,
        server: &ManagedServer,
        inner: &mut ServerInner,
    ) -> Result<()> {
        let controller = server.controller();
        let process_name = server.process_name();

        match *self {
            TransitionTask::AddProcess => {
                let request = AddProcessRequest {
                    process_name: process_name.to_string(),
                    process_id: server.process_id(),
                    command: inner.boot.command.clone(),
                    working_dir: inner.boot.working_dir.clone(),
                    env: inner.boot.env.clone(),
                };
                controller.add_process(request).await
            }
            TransitionTask::StartProcess => {
                inner.unstable = false;
                controller.start_process(process_name).await
            }
            TransitionTask::SendStdin => {
                let descriptor = BootDescriptor {
                    server_name: server.server_name().to_string(),
                    auth_token: inner.auth_token.clone(),
                    suspend: inner.boot.suspend,
                    callback_address: server.callback_address().map(str::to_string),
                };
                let line = descriptor.to_line()?;
                let mut sink = controller.send_stdin(process_name).await?;
                sink.write_all(&line)
                    .await
                    .map_err(|e| DomainError::process_controller("write boot descriptor", e))?;
                sink.shutdown()
                    .await
                    .map_err(|e| DomainError::process_controller("close stdin", e))
            }
            TransitionTask::Reconnect => {
                controller
                    .reconnect_process(process_name, &inner.auth_token)
                    .await
            }
            TransitionTask::StopServer { graceful } => {
                if let (Some(timeout), Some(client)) = (graceful, inner.client.clone()) {
                    match graceful_shutdown(client, timeout).await {
                        Ok(result) => {
                            debug!(server = %server.server_name(), "graceful shutdown accepted");
                            let bound = timeout + GRACEFUL_SHUTDOWN_MARGIN;
                            escalate_unless_exited(server, result, bound);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(
                                server = %server.server_name(),
                                error = %e,
                                "graceful shutdown failed, stopping process"
                            );
                        }
                    }
                }
                controller.stop_process(process_name).await
            }
            TransitionTask::RemoveProcess => controller.remove_process(process_name).await,
            TransitionTask::Reload { permit, suspend } => {
                let client = inner
                    .client
                    .clone()
                    .ok_or_else(|| DomainError::NotConnected(server.server_name().to_string()))?;
                let prepared = client
                    .execute(ServerOperation::Reload { permit, suspend })
                    .await?;
                if prepared.is_failed() {
                    let description = prepared
                        .prepared_response()
                        .failure_description()
                        .unwrap_or("reload refused")
                        .to_string();
                    let _ = prepared.rollback();
                    return Err(DomainError::ManagementChannel(description));
                }
                // Completion is signalled by the server registering its channel again
                let _ = prepared.commit();
                Ok(())
            }
        }
    }
}

/// Issue a shutdown operation and commit it. The prepare phase is bounded by
/// `timeout` plus a fixed margin; the committed final result is returned.
async fn graceful_shutdown(
    client: Arc<dyn ManagementClient>,
    timeout: Duration,
) -> Result<OperationFuture> {
    let bound = timeout + GRACEFUL_SHUTDOWN_MARGIN;
    let prepared = tokio::time::timeout(bound, client.execute(ServerOperation::shutdown(timeout)))
        .await
        .map_err(|_| {
            DomainError::Timeout(format!("shutdown not acknowledged in {}s", bound.as_secs()))
        })??;

    if prepared.is_failed() {
        let description = prepared
            .prepared_response()
            .failure_description()
            .unwrap_or("shutdown refused")
            .to_string();
        prepared.rollback().cancel();
        return Err(DomainError::ManagementChannel(description));
    }

    Ok(prepared.commit())
}

/// Watch a committed shutdown in the background. Unless the operation
/// succeeds and the process exits within `bound`, the process is stopped
/// through the supervisor. The server lock is not held while waiting.
fn escalate_unless_exited(server: &ManagedServer, result: OperationFuture, bound: Duration) {
    let controller = server.controller().clone();
    let server_name = server.server_name().to_string();
    let process_name = server.process_name().to_string();
    let mut snapshot = server.subscribe();

    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + bound;
        let outcome = match result.wait(Some(bound)).await {
            Ok(response) => match response.failure_description() {
                Some(description) => Err(DomainError::ManagementChannel(description.to_string())),
                None => tokio::time::timeout_at(
                    deadline,
                    snapshot.wait_for(|s| {
                        !matches!(
                            s.internal,
                            InternalState::ServerStarted | InternalState::ProcessStopping
                        )
                    }),
                )
                .await
                .map(|_| ())
                .map_err(|_| {
                    DomainError::Timeout(format!(
                        "process still running after {}s",
                        bound.as_secs()
                    ))
                }),
            },
            Err(e) => Err(e),
        };
        let Err(e) = outcome else {
            return;
        };

        // The stop transition may not be published yet
        let stopping = snapshot
            .wait_for(|s| s.internal != InternalState::ServerStarted)
            .await
            .map(|s| s.internal == InternalState::ProcessStopping)
            .unwrap_or(false);
        if !stopping {
            return;
        }
        warn!(
            server = %server_name,
            error = %e,
            "graceful shutdown did not complete, stopping process"
        );
        if let Err(e) = controller.stop_process(&process_name).await {
            error!(server = %server_name, error = %e, "failed to stop server process");
        }
    });
}

impl fmt::Display for TransitionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionTask::AddProcess => write!(f, "add-process"),
            TransitionTask::StartProcess => write!(f, "start-process"),
            TransitionTask::SendStdin => write!(f, "send-stdin"),
            TransitionTask::Reconnect => write!(f, "reconnect"),
            TransitionTask::StopServer { .. } => write!(f, "stop-server"),
            TransitionTask::RemoveProcess => write!(f, "remove-process"),
            TransitionTask::Reload { .. } => write!(f, "reload"),
        }
    }
}
