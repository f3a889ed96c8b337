//! Process Event Listener
//!
//! Single event loop delivering supervisor notifications to the inventory in
//! the order the supervisor sent them.

use super::server_inventory::ServerInventory;
use crate::domain::ports::ProcessEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ProcessEventListener {
    inventory: Arc<ServerInventory>,
}

impl ProcessEventListener {
    pub fn new(inventory: Arc<ServerInventory>) -> Self {
        Self { inventory }
    }

    /// Consume events until cancelled. The end of the stream means the
    /// supervisor connection is gone.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        cancellation_token: CancellationToken,
    ) {
        info!("Process event listener started");

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Process event listener received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Process controller event stream closed");
                        self.inventory.connection_finished();
                        break;
                    }
                },
            }
        }

        info!("Process event listener stopped");
    }

    pub async fn handle_event(&self, event: ProcessEvent) {
        debug!(event = ?event, "Received process event");
        match event {
            ProcessEvent::Added { process_name } => {
                self.inventory.server_process_added(&process_name).await
            }
            ProcessEvent::Started { process_name } => {
                self.inventory.server_process_started(&process_name).await
            }
            ProcessEvent::Stopped {
                process_name,
                uptime,
            } => {
                self.inventory
                    .server_process_stopped(&process_name, uptime)
                    .await
            }
            ProcessEvent::Removed { process_name } => {
                self.inventory.server_process_removed(&process_name).await
            }
            ProcessEvent::OperationFailed {
                process_name,
                operation,
            } => {
                self.inventory
                    .operation_failed(&process_name, operation)
                    .await
            }
            ProcessEvent::Unstable { process_name } => {
                self.inventory.server_unstable(&process_name).await
            }
            ProcessEvent::Inventory(processes) => self.inventory.process_inventory(processes),
        }
    }
}
