//! Server Inventory Service
//!
//! Fleet-wide registry of managed servers. Routes requests and supervisor or
//! management-channel notifications to the right `ManagedServer` and owns the
//! host-wide latches (`shutdown`, `connection_finished`).

use crate::domain::constants::{DEFAULT_BLOCKING_TIMEOUT_SEC, DEFAULT_INVENTORY_TIMEOUT_SEC};
use crate::domain::ports::{ManagementClient, ProcessControllerClient, ProcessOperation};
use crate::domain::{
    DomainError, InternalState, ManagedServer, ProcessInfo, Result, ServerBootConfiguration,
    ServerStatus, is_server_process, server_name_of, validate_server_name,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Tunables of the inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySettings {
    /// Extra time a fleet-wide caller waits on each server
    pub blocking_timeout: Duration,
    /// How long to wait for the supervisor to answer an inventory request
    pub inventory_timeout: Duration,
    /// Graceful timeout applied to stop requests that do not name one
    pub default_graceful_timeout: Option<Duration>,
    /// Address servers call back to, passed in the boot descriptor
    pub callback_address: Option<String>,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            blocking_timeout: Duration::from_secs(DEFAULT_BLOCKING_TIMEOUT_SEC),
            inventory_timeout: Duration::from_secs(DEFAULT_INVENTORY_TIMEOUT_SEC),
            default_graceful_timeout: None,
            callback_address: None,
        }
    }
}

/// Shared monitor value. Every change bumps `generation`, which is what
/// coarse waiters wake on.
#[derive(Debug, Clone, Default)]
pub struct InventoryMonitor {
    pub shutdown: bool,
    pub connection_finished: bool,
    pub generation: u64,
    /// Last inventory reported by the supervisor
    pub inventory: Arc<HashMap<String, ProcessInfo>>,
    pub inventory_generation: u64,
}

impl InventoryMonitor {
    pub fn is_latched(&self) -> bool {
        self.shutdown || self.connection_finished
    }
}

pub struct ServerInventory {
    pub(super) controller: Arc<dyn ProcessControllerClient>,
    pub(super) settings: InventorySettings,
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
    next_process_id: AtomicU32,
    monitor: watch::Sender<InventoryMonitor>,
}

impl ServerInventory {
    pub fn new(controller: Arc<dyn ProcessControllerClient>, settings: InventorySettings) -> Self {
        let (monitor, _) = watch::channel(InventoryMonitor::default());
        Self {
            controller,
            settings,
            servers: RwLock::new(HashMap::new()),
            next_process_id: AtomicU32::new(1),
            monitor,
        }
    }

    pub fn settings(&self) -> &InventorySettings {
        &self.settings
    }

    pub fn monitor(&self) -> InventoryMonitor {
        self.monitor.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InventoryMonitor> {
        self.monitor.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.monitor.borrow().shutdown
    }

    pub fn is_connection_finished(&self) -> bool {
        self.monitor.borrow().connection_finished
    }

    pub fn server(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn servers(&self) -> Vec<Arc<ManagedServer>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Names of every tracked server, sorted
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn determine_server_status(&self, name: &str) -> ServerStatus {
        self.server(name)
            .map(|server| server.status())
            .unwrap_or(ServerStatus::Stopped)
    }

    pub(super) fn notify(&self) {
        self.monitor.send_modify(|m| m.generation += 1);
    }

    pub(super) fn check_accepting(&self) -> Result<()> {
        if self.monitor.borrow().is_latched() {
            return Err(DomainError::HostAlreadyShutdown);
        }
        Ok(())
    }

    fn with_default_graceful_timeout(
        &self,
        mut boot: ServerBootConfiguration,
    ) -> ServerBootConfiguration {
        if boot.graceful_timeout.is_none() {
            boot.graceful_timeout = self.settings.default_graceful_timeout;
        }
        boot
    }

    fn get_or_create(&self, name: &str) -> Arc<ManagedServer> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        servers
            .entry(name.to_string())
            .or_insert_with(|| self.create_server(name))
            .clone()
    }

    fn create_server(&self, name: &str) -> Arc<ManagedServer> {
        let process_id = self.next_process_id.fetch_add(1, Ordering::Relaxed);
        debug!(server = %name, process_id, "tracking new server");
        Arc::new(ManagedServer::new(
            name,
            process_id,
            self.controller.clone(),
            self.settings.callback_address.clone(),
        ))
    }

    fn server_by_process(&self, process_name: &str) -> Option<Arc<ManagedServer>> {
        let Some(name) = server_name_of(process_name) else {
            debug!(process = %process_name, "ignoring notification for non-server process");
            return None;
        };
        let server = self.server(name);
        if server.is_none() {
            debug!(process = %process_name, "ignoring notification for unknown server");
        }
        server
    }

    fn server_by_name(&self, name: &str) -> Option<Arc<ManagedServer>> {
        let server = self.server(name);
        if server.is_none() {
            debug!(server = %name, "ignoring notification for unknown server");
        }
        server
    }

    /// Wait on a server until it reaches one of `states`, its required state
    /// leaves `required`, or the supervisor connection is lost
    async fn await_server(
        &self,
        server: &ManagedServer,
        required: InternalState,
        states: &[InternalState],
    ) -> bool {
        let mut monitor = self.monitor.subscribe();
        tokio::select! {
            reached = server.await_while_required(required, states) => reached,
            _ = monitor.wait_for(|m| m.connection_finished) => false,
        }
    }

    /// Start a server, creating its entry on first use. A blocking call waits
    /// for the server to be fully started, otherwise only until it opened its
    /// management channel.
    pub async fn start_server(
        &self,
        name: &str,
        boot: ServerBootConfiguration,
        blocking: bool,
    ) -> Result<ServerStatus> {
        self.check_accepting()?;
        validate_server_name(name)?;
        boot.validate()?;
        let boot = self.with_default_graceful_timeout(boot);

        let server = loop {
            let server = self.get_or_create(name);
            match server.start(boot.clone()).await {
                Err(DomainError::ServerRetired(_)) => {
                    debug!(server = %name, "entry removed concurrently, retrying start");
                }
                started => {
                    self.notify();
                    started?;
                    break server;
                }
            }
        };

        let targets: &[InternalState] = if blocking {
            &[InternalState::ServerStarted]
        } else {
            &[InternalState::ServerStarting, InternalState::ServerStarted]
        };
        self.await_server(&server, InternalState::ServerStarted, targets)
            .await;
        Ok(server.status())
    }

    /// Stop a server. Unknown servers are already stopped.
    pub async fn stop_server(
        &self,
        name: &str,
        graceful: Option<Duration>,
        blocking: bool,
    ) -> ServerStatus {
        let Some(server) = self.server(name) else {
            return ServerStatus::Stopped;
        };
        if self.is_connection_finished() {
            debug!(server = %name, "process controller gone, not stopping");
            return server.status();
        }

        server.stop(graceful).await;
        self.notify();

        if blocking {
            self.await_server(&server, InternalState::Stopped, &[InternalState::Stopped])
                .await;
        }
        server.status()
    }

    /// Stop a server, wait until it is gone from the registry, then start it again
    pub async fn restart_server(
        &self,
        name: &str,
        boot: ServerBootConfiguration,
        graceful: Option<Duration>,
        blocking: bool,
    ) -> Result<ServerStatus> {
        self.check_accepting()?;

        if let Some(server) = self.server(name) {
            info!(server = %name, "restarting server");
            server.stop(graceful).await;
            self.notify();

            let mut monitor = self.monitor.subscribe();
            loop {
                if monitor.borrow_and_update().is_latched() {
                    return Err(DomainError::HostAlreadyShutdown);
                }
                match self.server(name) {
                    None => break,
                    Some(current) if current.status() == ServerStatus::Failed => {
                        return Err(DomainError::InvalidStateTransition {
                            server: name.to_string(),
                            current: current.internal_state().to_string(),
                            required: current.required_state().to_string(),
                        });
                    }
                    Some(_) => {}
                }
                if monitor.changed().await.is_err() {
                    return Err(DomainError::HostAlreadyShutdown);
                }
            }
        }

        self.start_server(name, boot, blocking).await
    }

    /// Reload a fully started server. Returns whether the reload was dispatched.
    pub async fn reload_server(
        &self,
        name: &str,
        permit: u32,
        blocking: bool,
        suspend: bool,
    ) -> Result<bool> {
        self.check_accepting()?;
        let Some(server) = self.server(name) else {
            return Ok(false);
        };

        let dispatched = server.reload(permit, suspend).await;
        self.notify();
        if dispatched && blocking {
            self.await_server(
                &server,
                InternalState::ServerStarted,
                &[InternalState::ServerStarted],
            )
            .await;
        }
        Ok(dispatched)
    }

    pub async fn destroy_server(&self, name: &str) {
        let Some(server) = self.server(name) else {
            return;
        };
        if self.is_connection_finished() {
            debug!(server = %name, "process controller gone, not destroying");
            return;
        }
        server.destroy().await;
        self.notify();
    }

    pub async fn kill_server(&self, name: &str) {
        let Some(server) = self.server(name) else {
            return;
        };
        if self.is_connection_finished() {
            debug!(server = %name, "process controller gone, not killing");
            return;
        }
        server.kill().await;
        self.notify();
    }

    /// Adopt a server process found in the supervisor inventory after a host
    /// controller restart. Servers already tracked are left untouched.
    pub async fn reconnect_server(
        &self,
        name: &str,
        boot: ServerBootConfiguration,
        running: bool,
        stopping: bool,
    ) -> Result<()> {
        self.check_accepting()?;
        validate_server_name(name)?;

        let server = {
            let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
            if servers.contains_key(name) {
                debug!(server = %name, "server already tracked, not reconnecting");
                return Ok(());
            }
            let server = self.create_server(name);
            servers.insert(name.to_string(), server.clone());
            server
        };

        info!(server = %name, running, stopping, "adopting server process");
        let boot = self.with_default_graceful_timeout(boot);
        match (running, stopping) {
            (true, false) => server.reconnect_server_process(boot).await,
            (true, true) => server.set_server_process_stopping().await,
            (false, _) => server.remove_server_process().await,
        }
        self.notify();
        Ok(())
    }

    /// Ask the supervisor for its process inventory and wait for the answer
    pub async fn determine_running_processes(
        &self,
        servers_only: bool,
    ) -> Result<HashMap<String, ProcessInfo>> {
        if self.is_connection_finished() {
            return Err(DomainError::HostAlreadyShutdown);
        }

        let mut monitor = self.monitor.subscribe();
        let seen = monitor.borrow_and_update().inventory_generation;
        self.controller.request_process_inventory().await?;

        let answered = tokio::time::timeout(
            self.settings.inventory_timeout,
            monitor.wait_for(|m| m.inventory_generation > seen || m.connection_finished),
        )
        .await;
        let inventory = match answered {
            Ok(Ok(m)) if m.inventory_generation > seen => m.inventory.clone(),
            Ok(_) => return Err(DomainError::HostAlreadyShutdown),
            Err(_) => {
                return Err(DomainError::Timeout(
                    "process inventory not received".to_string(),
                ));
            }
        };

        Ok(inventory
            .iter()
            .filter(|(name, _)| !servers_only || is_server_process(name))
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect())
    }

    /// Stop every tracked server, optionally waiting until all of them are
    /// stopped or failed
    pub async fn stop_servers(&self, graceful: Option<Duration>, block_until_stopped: bool) {
        if !self.is_connection_finished() {
            for server in self.servers() {
                server.stop(graceful).await;
            }
            self.notify();
        }

        if !block_until_stopped {
            return;
        }
        let mut monitor = self.monitor.subscribe();
        loop {
            if monitor.borrow_and_update().connection_finished {
                break;
            }
            if self.servers().iter().all(|s| s.status().is_settled()) {
                break;
            }
            if monitor.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait while any of the named servers is still starting (`started`) or
    /// stopping
    pub async fn await_servers_state(&self, names: &[String], started: bool) {
        let pending = if started {
            ServerStatus::Starting
        } else {
            ServerStatus::Stopping
        };

        let mut monitor = self.monitor.subscribe();
        loop {
            if monitor.borrow_and_update().is_latched() {
                break;
            }
            let waiting = names
                .iter()
                .filter_map(|name| self.server(name))
                .any(|server| server.status() == pending);
            if !waiting {
                break;
            }
            if monitor.changed().await.is_err() {
                break;
            }
        }
    }

    /// Raise the shutdown latch and optionally stop every server
    pub async fn shutdown(
        &self,
        shutdown_servers: bool,
        graceful: Option<Duration>,
        block_until_stopped: bool,
    ) {
        let mut first = false;
        self.monitor.send_if_modified(|m| {
            if m.shutdown {
                return false;
            }
            m.shutdown = true;
            m.generation += 1;
            first = true;
            true
        });
        if !first {
            return;
        }

        info!(shutdown_servers, "host controller shutting down");
        if shutdown_servers && !self.is_connection_finished() {
            self.stop_servers(graceful, block_until_stopped).await;
        }
    }

    pub async fn server_process_added(&self, process_name: &str) {
        if let Some(server) = self.server_by_process(process_name) {
            server.process_added().await;
        }
        self.notify();
    }

    pub async fn server_process_started(&self, process_name: &str) {
        if let Some(server) = self.server_by_process(process_name) {
            server.process_started().await;
        }
        self.notify();
    }

    pub async fn server_process_stopped(&self, process_name: &str, uptime: Duration) {
        if let Some(server) = self.server_by_process(process_name) {
            server.process_finished(uptime).await;
        }
        self.notify();
    }

    pub async fn server_process_removed(&self, process_name: &str) {
        if let Some(server) = self.server_by_process(process_name) {
            server.process_removed().await;
            let retired = server
                .retire(|| {
                    let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
                    let same_entry = servers
                        .get(server.server_name())
                        .is_some_and(|tracked| Arc::ptr_eq(tracked, &server));
                    if same_entry {
                        servers.remove(server.server_name());
                    }
                })
                .await;
            if retired {
                debug!(server = %server.server_name(), "server removed from inventory");
            }
        }
        self.notify();
    }

    pub async fn server_unstable(&self, process_name: &str) {
        if let Some(server) = self.server_by_process(process_name) {
            server.process_unstable().await;
        }
        self.notify();
    }

    /// A supervisor request failed after being accepted
    pub async fn operation_failed(&self, process_name: &str, operation: ProcessOperation) {
        if let Some(server) = self.server_by_process(process_name) {
            let state = match operation {
                ProcessOperation::Add => InternalState::ProcessAdding,
                ProcessOperation::Start => InternalState::ProcessStarting,
                ProcessOperation::Stop => InternalState::ProcessStopping,
                ProcessOperation::SendStdin | ProcessOperation::Reconnect => {
                    InternalState::SendStdin
                }
                ProcessOperation::Remove => InternalState::ProcessRemoving,
            };
            warn!(process = %process_name, operation = %operation, "process operation failed");
            server.transition_failed(state).await;
        }
        self.notify();
    }

    pub fn process_inventory(&self, inventory: HashMap<String, ProcessInfo>) {
        self.monitor.send_modify(|m| {
            m.inventory = Arc::new(inventory);
            m.inventory_generation += 1;
            m.generation += 1;
        });
    }

    pub async fn server_communication_registered(
        &self,
        name: &str,
        client: Arc<dyn ManagementClient>,
    ) {
        if let Some(server) = self.server_by_name(name) {
            server.channel_registered(client).await;
        }
        self.notify();
    }

    /// A server adopted through [`ServerInventory::reconnect_server`] opened its
    /// management channel again
    pub async fn server_reconnected(&self, name: &str, client: Arc<dyn ManagementClient>) {
        self.server_communication_registered(name, client).await
    }

    pub async fn server_started(&self, name: &str) {
        if let Some(server) = self.server_by_name(name) {
            server.server_started().await;
        }
        self.notify();
    }

    pub async fn server_start_failed(&self, name: &str) {
        if let Some(server) = self.server_by_name(name) {
            server.server_start_failed().await;
        }
        self.notify();
    }

    /// The management channel of a server closed. Returns whether the
    /// registration may be forgotten.
    pub async fn server_unregistered(&self, name: &str) -> bool {
        let forget = match self.server_by_name(name) {
            Some(server) => server.callback_unregistered(self.is_shutdown()).await,
            None => true,
        };
        self.notify();
        forget
    }

    /// The supervisor connection is gone. Server state is left as last known.
    pub fn connection_finished(&self) {
        let raised = self.monitor.send_if_modified(|m| {
            if m.connection_finished {
                return false;
            }
            m.connection_finished = true;
            m.generation += 1;
            true
        });
        if raised {
            warn!("process controller connection finished");
        }
    }
}
