//! Fleet-wide management operations
//!
//! Suspend or resume a set of servers: dispatch to every server at once, then
//! collect the pending results concurrently within a per-server budget.

use super::server_inventory::ServerInventory;
use crate::domain::ports::OperationFuture;
use crate::domain::{DomainError, ManagedServer, Result};
use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a server did not complete a fleet-wide operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFailure {
    /// The server reported a failure, or the request could not be dispatched
    Failed(String),
    /// No answer within the budget; the request was cancelled
    TimedOut,
    /// The pending result was abandoned by the management channel
    Interrupted,
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFailure::Failed(description) => write!(f, "failed: {description}"),
            ServerFailure::TimedOut => write!(f, "timed out"),
            ServerFailure::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailureReport {
    pub server_name: String,
    pub failure: ServerFailure,
}

impl ServerFailureReport {
    fn new(server_name: &str, failure: ServerFailure) -> Self {
        Self {
            server_name: server_name.to_string(),
            failure,
        }
    }
}

impl ServerInventory {
    /// Suspend the named servers. Returns the servers that did not suspend;
    /// an empty list means every tracked server suspended.
    pub async fn suspend_servers(
        &self,
        names: &[String],
        timeout: Option<Duration>,
    ) -> Result<Vec<ServerFailureReport>> {
        self.check_accepting()?;
        let budget = timeout.unwrap_or_default() + self.settings.blocking_timeout;
        info!(servers = names.len(), timeout = ?timeout, "suspending servers");
        Ok(self
            .run_fleet_operation("suspend", names, budget, |server| async move {
                server.suspend(timeout).await
            })
            .await)
    }

    /// Resume the named servers. Returns the servers that did not resume.
    pub async fn resume_servers(&self, names: &[String]) -> Result<Vec<ServerFailureReport>> {
        self.check_accepting()?;
        let budget = self.settings.blocking_timeout;
        info!(servers = names.len(), "resuming servers");
        Ok(self
            .run_fleet_operation("resume", names, budget, |server| async move {
                server.resume().await
            })
            .await)
    }

    async fn run_fleet_operation<F, Fut>(
        &self,
        operation: &str,
        names: &[String],
        budget: Duration,
        dispatch: F,
    ) -> Vec<ServerFailureReport>
    where
        F: Fn(Arc<ManagedServer>) -> Fut,
        Fut: Future<Output = Result<OperationFuture>>,
    {
        let tracked = names.iter().filter_map(|name| match self.server(name) {
            Some(server) => Some((name.as_str(), server)),
            None => {
                debug!(server = %name, operation, "server not tracked, skipping");
                None
            }
        });

        let dispatch = &dispatch;
        let dispatched = join_all(tracked.map(|(name, server)| async move {
            (name, tokio::time::timeout(budget, dispatch(server)).await)
        }))
        .await;

        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for (name, dispatched) in dispatched {
            match dispatched {
                Ok(Ok(future)) => pending.push((name, future)),
                Ok(Err(e)) => failures.push(ServerFailureReport::new(
                    name,
                    ServerFailure::Failed(e.to_string()),
                )),
                Err(_) => failures.push(ServerFailureReport::new(name, ServerFailure::TimedOut)),
            }
        }

        let collected = join_all(
            pending
                .into_iter()
                .map(|(name, future)| async move { (name, future.wait(Some(budget)).await) }),
        )
        .await;

        for (name, outcome) in collected {
            let failure = match outcome {
                Ok(response) => response
                    .failure_description()
                    .map(|description| ServerFailure::Failed(description.to_string())),
                Err(DomainError::Timeout(_)) => Some(ServerFailure::TimedOut),
                Err(_) => Some(ServerFailure::Interrupted),
            };
            if let Some(failure) = failure {
                failures.push(ServerFailureReport::new(name, failure));
            }
        }

        for report in &failures {
            warn!(
                server = %report.server_name,
                operation,
                failure = %report.failure,
                "fleet operation did not complete"
            );
        }
        failures
    }
}
