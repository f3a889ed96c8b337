//! ManagedServer entity
//! Per-server lifecycle state machine reconciling the required state with the
//! state reported by the process supervisor and the management channel

use super::transition::TransitionTask;
use crate::domain::ports::{ManagementClient, OperationFuture, ProcessControllerClient};
use crate::domain::{
    DomainError, InternalState, OperationResponse, Result, ServerBootConfiguration,
    ServerOperation, ServerStatus, server_process_name,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lock-free view of a server, published after every change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerSnapshot {
    pub internal: InternalState,
    pub required: InternalState,
    pub unstable: bool,
}

impl ServerSnapshot {
    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_states(self.internal, self.required)
    }
}

/// Mutable state, only touched with the server lock held
#[derive(Default)]
pub(crate) struct ServerInner {
    pub(super) internal: InternalState,
    pub(super) required: InternalState,
    pub(super) boot: ServerBootConfiguration,
    pub(super) auth_token: String,
    pub(super) unstable: bool,
    pub(super) client: Option<Arc<dyn ManagementClient>>,
    /// Forgotten by the registry; never starts again
    pub(super) retired: bool,
}

pub struct ManagedServer {
    server_name: String,
    process_name: String,
    process_id: u32,
    callback_address: Option<String>,
    controller: Arc<dyn ProcessControllerClient>,
    inner: Mutex<ServerInner>,
    snapshot: watch::Sender<ServerSnapshot>,
}

fn new_auth_token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl ManagedServer {
    pub fn new(
        server_name: impl Into<String>,
        process_id: u32,
        controller: Arc<dyn ProcessControllerClient>,
        callback_address: Option<String>,
    ) -> Self {
        let server_name = server_name.into();
        let (snapshot, _) = watch::channel(ServerSnapshot::default());
        Self {
            process_name: server_process_name(&server_name),
            server_name,
            process_id,
            callback_address,
            controller,
            inner: Mutex::new(ServerInner::default()),
            snapshot,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn callback_address(&self) -> Option<&str> {
        self.callback_address.as_deref()
    }

    pub(super) fn controller(&self) -> &Arc<dyn ProcessControllerClient> {
        &self.controller
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        *self.snapshot.borrow()
    }

    pub fn internal_state(&self) -> InternalState {
        self.snapshot().internal
    }

    pub fn required_state(&self) -> InternalState {
        self.snapshot().required
    }

    pub fn status(&self) -> ServerStatus {
        self.snapshot().status()
    }

    pub fn is_unstable(&self) -> bool {
        self.snapshot().unstable
    }

    /// Retire a fully stopped server and run `forget` with the server lock
    /// held, so that no start can slip in between. Returns whether the server
    /// was retired.
    pub async fn retire(&self, forget: impl FnOnce()) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.retired {
            return true;
        }
        if inner.internal != InternalState::Stopped || inner.required != InternalState::Stopped {
            return false;
        }
        inner.retired = true;
        forget();
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerSnapshot> {
        self.snapshot.subscribe()
    }

    pub async fn auth_token(&self) -> String {
        self.inner.lock().await.auth_token.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.client.is_some()
    }

    fn publish(&self, inner: &ServerInner) {
        self.snapshot.send_replace(ServerSnapshot {
            internal: inner.internal,
            required: inner.required,
            unstable: inner.unstable,
        });
    }

    /// Run at most one step of the transition table
    async fn transition(&self, inner: &mut ServerInner, check_async: bool) -> bool {
        let current = inner.internal;
        if check_async && current.is_async() {
            return false;
        }
        let Some(next) = current.next_state(inner.required) else {
            return false;
        };
        let Some(task) = TransitionTask::for_target(next) else {
            return false;
        };
        self.internal_set_state(inner, task, current, next).await
    }

    async fn internal_set_state(
        &self,
        inner: &mut ServerInner,
        task: TransitionTask,
        from: InternalState,
        to: InternalState,
    ) -> bool {
        if inner.internal != from {
            debug!(
                server = %self.server_name,
                expected = %from,
                actual = %inner.internal,
                "skipping transition from stale state"
            );
            return false;
        }

        debug!(server = %self.server_name, from = %from, to = %to, task = %task, "transition");
        match task.execute(self, inner).await {
            Ok(()) => {
                inner.internal = to;
                self.publish(inner);
                true
            }
            Err(e) => {
                inner.internal = to.rollback_state();
                inner.required = InternalState::Failed;
                let action = if to.is_stopping() { "stop" } else { "start" };
                error!(
                    server = %self.server_name,
                    task = %task,
                    error = %e,
                    "failed to {action} server"
                );
                self.publish(inner);
                false
            }
        }
    }

    /// Guarded completion of an asynchronous state, driven by a notification
    fn complete(&self, inner: &mut ServerInner, from: InternalState, to: InternalState) -> bool {
        if inner.internal != from {
            debug!(
                server = %self.server_name,
                expected = %from,
                actual = %inner.internal,
                "ignoring stale notification"
            );
            return false;
        }
        inner.internal = to;
        self.publish(inner);
        true
    }

    /// Require the server to run with the given boot configuration
    pub async fn start(&self, boot: ServerBootConfiguration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.retired {
            return Err(DomainError::ServerRetired(self.server_name.clone()));
        }
        if inner.required == InternalState::ServerStarted {
            debug!(server = %self.server_name, "server already required to run");
            return Ok(());
        }
        if inner.required != InternalState::Failed && inner.internal != inner.required {
            return Err(DomainError::InvalidStateTransition {
                server: self.server_name.clone(),
                current: inner.internal.to_string(),
                required: inner.required.to_string(),
            });
        }

        info!(server = %self.server_name, "starting server");
        inner.boot = boot;
        inner.auth_token = new_auth_token();
        inner.required = InternalState::ServerStarted;
        self.publish(&inner);
        self.transition(&mut inner, true).await;
        Ok(())
    }

    /// Require the server to stop. From `SERVER_STARTED` a graceful timeout
    /// first asks the server to shut itself down; without one the timeout of
    /// the boot configuration applies.
    pub async fn stop(&self, graceful: Option<Duration>) {
        self.request_stop(graceful, true).await
    }

    async fn request_stop(&self, graceful: Option<Duration>, use_configured: bool) {
        let mut inner = self.inner.lock().await;
        let graceful = match graceful {
            Some(timeout) => Some(timeout),
            None if use_configured => inner.boot.graceful_timeout,
            None => None,
        };
        if inner.required != InternalState::Stopped {
            info!(server = %self.server_name, graceful_timeout = ?graceful, "stopping server");
            inner.required = InternalState::Stopped;
            self.publish(&inner);
        }

        if inner.internal == InternalState::ServerStarted {
            self.internal_set_state(
                &mut inner,
                TransitionTask::StopServer { graceful },
                InternalState::ServerStarted,
                InternalState::ProcessStopping,
            )
            .await;
        } else {
            self.transition(&mut inner, false).await;
        }
    }

    pub async fn destroy(&self) {
        self.force_stop(false).await
    }

    pub async fn kill(&self) {
        self.force_stop(true).await
    }

    async fn force_stop(&self, kill: bool) {
        if self.required_state() != InternalState::Stopped {
            self.request_stop(None, false).await;
        }

        let inner = self.inner.lock().await;
        if inner.required != InternalState::Stopped || inner.internal == InternalState::Stopped {
            return;
        }
        let result = if kill {
            info!(server = %self.server_name, state = %inner.internal, "killing server process");
            self.controller.kill_process(&self.process_name).await
        } else {
            info!(server = %self.server_name, state = %inner.internal, "destroying server process");
            self.controller.destroy_process(&self.process_name).await
        };
        if let Err(e) = result {
            debug!(server = %self.server_name, error = %e, kill, "forced stop request failed");
        }
    }

    /// Reload a fully started server. Returns whether the reload was dispatched.
    pub async fn reload(&self, permit: u32, suspend: bool) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.internal != InternalState::ServerStarted {
            debug!(server = %self.server_name, state = %inner.internal, "reload ignored");
            return false;
        }
        info!(server = %self.server_name, permit, suspend, "reloading server");
        inner.boot.suspend = suspend;
        self.internal_set_state(
            &mut inner,
            TransitionTask::Reload { permit, suspend },
            InternalState::ServerStarted,
            InternalState::Reloading,
        )
        .await
    }

    pub async fn suspend(&self, timeout: Option<Duration>) -> Result<OperationFuture> {
        self.execute_operation(ServerOperation::suspend(timeout)).await
    }

    pub async fn resume(&self) -> Result<OperationFuture> {
        self.execute_operation(ServerOperation::Resume).await
    }

    /// Execute and commit an operation over the management channel. The lock is
    /// only held to borrow the client.
    async fn execute_operation(&self, operation: ServerOperation) -> Result<OperationFuture> {
        let client = self
            .inner
            .lock()
            .await
            .client
            .clone()
            .ok_or_else(|| DomainError::NotConnected(self.server_name.clone()))?;

        debug!(server = %self.server_name, operation = %operation, "executing operation");
        let prepared = client.execute(operation).await?;
        if prepared.is_failed() {
            let response: OperationResponse = prepared.prepared_response().clone();
            prepared.rollback().cancel();
            return Ok(OperationFuture::ready(response));
        }
        Ok(prepared.commit())
    }

    /// Wait until the server reaches `expected`. Returns false as soon as the
    /// required state changes.
    pub async fn await_state(&self, expected: InternalState) -> bool {
        self.await_any(&[expected]).await
    }

    /// Like [`ManagedServer::await_state`], satisfied by any of `expected`
    pub async fn await_any(&self, expected: &[InternalState]) -> bool {
        let required = self.required_state();
        self.await_while_required(required, expected).await
    }

    /// Wait for any of `expected` as long as the required state stays `required`
    pub async fn await_while_required(
        &self,
        required: InternalState,
        expected: &[InternalState],
    ) -> bool {
        let mut receiver = self.snapshot.subscribe();
        receiver
            .wait_for(|s| s.required != required || expected.contains(&s.internal))
            .await
            .map(|s| s.required == required && expected.contains(&s.internal))
            .unwrap_or(false)
    }

    pub async fn process_added(&self) {
        let mut inner = self.inner.lock().await;
        self.complete(&mut inner, InternalState::ProcessAdding, InternalState::ProcessAdded);
        self.transition(&mut inner, true).await;
    }

    pub async fn process_started(&self) {
        let mut inner = self.inner.lock().await;
        self.complete(&mut inner, InternalState::ProcessStarting, InternalState::ProcessStarted);
        self.transition(&mut inner, true).await;
    }

    pub async fn process_finished(&self, uptime: Duration) {
        let mut inner = self.inner.lock().await;
        inner.client = None;

        match inner.internal {
            InternalState::ProcessStopping => {
                info!(
                    server = %self.server_name,
                    uptime_secs = uptime.as_secs(),
                    "server process stopped"
                );
                inner.internal = InternalState::ProcessStopped;
                self.publish(&inner);
            }
            InternalState::Stopped
            | InternalState::ProcessAdding
            | InternalState::ProcessAdded
            | InternalState::ProcessStopped
            | InternalState::ProcessRemoving => {
                debug!(
                    server = %self.server_name,
                    state = %inner.internal,
                    "ignoring stale process exit"
                );
            }
            current => {
                warn!(
                    server = %self.server_name,
                    state = %current,
                    uptime_secs = uptime.as_secs(),
                    "server process exited unexpectedly"
                );
                inner.internal = InternalState::ProcessStopped;
                if inner.required == InternalState::ServerStarted {
                    inner.required = InternalState::Failed;
                }
                self.publish(&inner);
            }
        }
        self.transition(&mut inner, true).await;
    }

    pub async fn process_removed(&self) {
        let mut inner = self.inner.lock().await;
        self.complete(&mut inner, InternalState::ProcessRemoving, InternalState::Stopped);
        self.transition(&mut inner, true).await;
    }

    /// The server opened its management channel after boot or reload
    pub async fn channel_registered(&self, client: Arc<dyn ManagementClient>) {
        let mut inner = self.inner.lock().await;
        let from = inner.internal;
        if matches!(from, InternalState::SendStdin | InternalState::Reloading) {
            inner.client = Some(client);
            self.complete(&mut inner, from, InternalState::ServerStarting);
        } else {
            debug!(server = %self.server_name, state = %from, "ignoring channel registration");
        }
        self.transition(&mut inner, true).await;
    }

    pub async fn server_started(&self) {
        let mut inner = self.inner.lock().await;
        if self.complete(&mut inner, InternalState::ServerStarting, InternalState::ServerStarted) {
            info!(server = %self.server_name, "server started");
        }
        self.transition(&mut inner, true).await;
    }

    /// The server booted but reported boot errors; the process keeps running
    pub async fn server_start_failed(&self) {
        let mut inner = self.inner.lock().await;
        if self.complete(&mut inner, InternalState::ServerStarting, InternalState::ServerStarted) {
            warn!(server = %self.server_name, "server started with boot errors");
            inner.required = InternalState::Failed;
            self.publish(&inner);
        }
        self.transition(&mut inner, true).await;
    }

    pub async fn process_unstable(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.unstable {
            warn!(server = %self.server_name, "server process is unstable");
            inner.unstable = true;
            self.publish(&inner);
        }
    }

    /// A supervisor request for `state` failed after it had been accepted
    pub async fn transition_failed(&self, state: InternalState) {
        let mut inner = self.inner.lock().await;
        if inner.internal != state {
            debug!(
                server = %self.server_name,
                failed = %state,
                actual = %inner.internal,
                "ignoring stale operation failure"
            );
            return;
        }

        let rollback = state.rollback_state();
        if state.is_stopping() {
            error!(server = %self.server_name, state = %state, "failed to stop server");
        } else {
            error!(server = %self.server_name, state = %state, "failed to start server");
        }
        inner.internal = rollback;
        inner.required = InternalState::Failed;
        self.publish(&inner);
        self.transition(&mut inner, true).await;
    }

    /// The management channel went away. Returns whether the caller may
    /// forget the registration; false when a reconnect has been re-armed.
    pub async fn callback_unregistered(&self, shutting_down: bool) -> bool {
        let mut inner = self.inner.lock().await;
        inner.client = None;

        let current = inner.internal;
        let running = matches!(
            current,
            InternalState::ProcessStarted
                | InternalState::SendStdin
                | InternalState::ServerStarting
                | InternalState::ServerStarted
        );
        if shutting_down || inner.required != InternalState::ServerStarted || !running {
            return true;
        }

        info!(
            server = %self.server_name,
            state = %current,
            "management channel lost, reconnecting"
        );
        inner.auth_token = new_auth_token();
        self.internal_set_state(
            &mut inner,
            TransitionTask::Reconnect,
            current,
            InternalState::SendStdin,
        )
        .await;
        false
    }

    /// Adopt a running server process and ask it to reconnect
    pub async fn reconnect_server_process(&self, boot: ServerBootConfiguration) {
        let mut inner = self.inner.lock().await;
        if inner.required == InternalState::ServerStarted {
            return;
        }
        debug!(server = %self.server_name, "reconnecting to running server process");
        inner.boot = boot;
        inner.auth_token = new_auth_token();
        inner.required = InternalState::ServerStarted;
        self.publish(&inner);
        self.internal_set_state(
            &mut inner,
            TransitionTask::Reconnect,
            InternalState::Stopped,
            InternalState::SendStdin,
        )
        .await;
    }

    /// Adopt a server process that is already being stopped
    pub async fn set_server_process_stopping(&self) {
        let mut inner = self.inner.lock().await;
        inner.required = InternalState::Stopped;
        if !self.complete(&mut inner, InternalState::Stopped, InternalState::ProcessStopping) {
            self.publish(&inner);
        }
    }

    /// Adopt a server process that is no longer running and remove it
    pub async fn remove_server_process(&self) {
        let mut inner = self.inner.lock().await;
        inner.required = InternalState::Stopped;
        self.publish(&inner);
        self.internal_set_state(
            &mut inner,
            TransitionTask::RemoveProcess,
            InternalState::Stopped,
            InternalState::ProcessRemoving,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BootDescriptor;
    use crate::domain::constants::GRACEFUL_SHUTDOWN_MARGIN;
    use crate::domain::ports::{
        ControllerCall, MockManagementClient, MockProcessController, PreparedOperation,
        ProcessOperation, StaticManagementClient, StaticReply,
    };

    fn setup() -> (Arc<ManagedServer>, MockProcessController) {
        let controller = MockProcessController::new();
        let server = Arc::new(ManagedServer::new(
            "server-one",
            1,
            Arc::new(controller.clone()),
            Some("127.0.0.1:9999".to_string()),
        ));
        (server, controller)
    }

    fn boot() -> ServerBootConfiguration {
        ServerBootConfiguration::new(vec!["/opt/server/bin/run".to_string()])
    }

    async fn drive_to_started(server: &ManagedServer, client: Arc<dyn ManagementClient>) {
        server.start(boot()).await.unwrap();
        server.process_added().await;
        server.process_started().await;
        server.channel_registered(client).await;
        server.server_started().await;
        assert_eq!(server.internal_state(), InternalState::ServerStarted);
    }

    #[tokio::test]
    async fn test_start_walks_through_every_step() {
        let (server, controller) = setup();

        server.start(boot()).await.unwrap();
        assert_eq!(server.internal_state(), InternalState::ProcessAdding);
        assert_eq!(server.status(), ServerStatus::Starting);

        server.process_added().await;
        assert_eq!(server.internal_state(), InternalState::ProcessStarting);

        server.process_started().await;
        assert_eq!(server.internal_state(), InternalState::SendStdin);

        server
            .channel_registered(Arc::new(StaticManagementClient::succeeding()))
            .await;
        assert_eq!(server.internal_state(), InternalState::ServerStarting);
        assert!(server.is_connected().await);

        server.server_started().await;
        assert_eq!(server.status(), ServerStatus::Started);

        let calls = controller.calls_for("Server:server-one");
        assert!(matches!(&calls[0], ControllerCall::Add(r) if r.process_id == 1));
        assert_eq!(calls[1], ControllerCall::Start("Server:server-one".to_string()));
        assert_eq!(calls[2], ControllerCall::SendStdin("Server:server-one".to_string()));
    }

    #[tokio::test]
    async fn test_boot_descriptor_written_to_stdin() {
        let (server, controller) = setup();
        server.start(boot().with_suspend(true)).await.unwrap();
        server.process_added().await;
        server.process_started().await;

        let stdin = controller.stdin_of("Server:server-one");
        let descriptor: BootDescriptor = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(descriptor.server_name, "server-one");
        assert_eq!(descriptor.auth_token, server.auth_token().await);
        assert_eq!(descriptor.auth_token.len(), 32);
        assert!(descriptor.suspend);
        assert_eq!(descriptor.callback_address.as_deref(), Some("127.0.0.1:9999"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (server, controller) = setup();
        server.start(boot()).await.unwrap();
        server.start(boot()).await.unwrap();
        assert_eq!(controller.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_start_rejected_while_stopping() {
        let (server, _controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;
        server.stop(None).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);

        let err = server.start(boot()).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_stale_notifications_are_ignored() {
        let (server, controller) = setup();
        server.process_started().await;
        server.server_started().await;
        server.process_removed().await;
        assert_eq!(server.internal_state(), InternalState::Stopped);
        assert!(controller.calls().is_empty());

        server.start(boot()).await.unwrap();
        server.process_added().await;
        // Duplicate delivery
        server.process_added().await;
        assert_eq!(server.internal_state(), InternalState::ProcessStarting);
        assert_eq!(controller.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_adding_completes_the_add_first() {
        let (server, controller) = setup();
        server.start(boot()).await.unwrap();
        server.stop(None).await;
        assert_eq!(server.internal_state(), InternalState::ProcessAdding);
        assert_eq!(server.status(), ServerStatus::Stopping);

        server.process_added().await;
        assert_eq!(server.internal_state(), InternalState::ProcessRemoving);
        server.process_removed().await;
        assert_eq!(server.internal_state(), InternalState::Stopped);
        assert!(server.retire(|| ()).await);

        let calls = controller.calls();
        assert!(matches!(calls.last(), Some(ControllerCall::Remove(_))));
        assert!(!calls.iter().any(|c| matches!(c, ControllerCall::Start(_))));
    }

    #[tokio::test]
    async fn test_stop_shortcut_from_send_stdin() {
        let (server, controller) = setup();
        server.start(boot()).await.unwrap();
        server.process_added().await;
        server.process_started().await;
        assert_eq!(server.internal_state(), InternalState::SendStdin);

        server.stop(Some(Duration::from_secs(10))).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);
        assert!(matches!(controller.calls().last(), Some(ControllerCall::Stop(_))));

        server.process_finished(Duration::from_secs(1)).await;
        assert_eq!(server.internal_state(), InternalState::ProcessRemoving);
        server.process_removed().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    async fn wait_for_hard_stop(controller: &MockProcessController) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while !controller
                .calls()
                .iter()
                .any(|c| matches!(c, ControllerCall::Stop(_)))
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("process was never stopped");
    }

    fn hard_stops(controller: &MockProcessController) -> usize {
        controller
            .calls()
            .iter()
            .filter(|c| matches!(c, ControllerCall::Stop(_)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_uses_shutdown_operation() {
        let (server, controller) = setup();
        let client = Arc::new(StaticManagementClient::succeeding());
        drive_to_started(&server, client.clone()).await;

        server.stop(Some(Duration::from_secs(30))).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);
        assert_eq!(
            client.executed(),
            vec![ServerOperation::Shutdown { timeout_secs: 30 }]
        );
        assert_eq!(hard_stops(&controller), 0);

        server.process_finished(Duration::from_secs(60)).await;
        assert_eq!(server.internal_state(), InternalState::ProcessRemoving);

        // The process exited on its own: nothing to escalate
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hard_stops(&controller), 0);
        assert_eq!(client.cancelled_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_shutdown_escalates_to_hard_stop() {
        let (server, controller) = setup();
        let client = Arc::new(StaticManagementClient::new(StaticReply::Hang));
        drive_to_started(&server, client.clone()).await;

        let stopped_at = tokio::time::Instant::now();
        server.stop(Some(Duration::from_secs(1))).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);
        assert_eq!(hard_stops(&controller), 0);

        wait_for_hard_stop(&controller).await;
        assert!(stopped_at.elapsed() >= Duration::from_secs(1) + GRACEFUL_SHUTDOWN_MARGIN);
        assert_eq!(client.cancelled_count(), 1);
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);

        server.process_finished(Duration::from_secs(10)).await;
        assert_eq!(server.internal_state(), InternalState::ProcessRemoving);
        assert_eq!(hard_stops(&controller), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_ignoring_shutdown_is_stopped() {
        let (server, controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;

        let stopped_at = tokio::time::Instant::now();
        server.stop(Some(Duration::from_secs(10))).await;

        wait_for_hard_stop(&controller).await;
        assert!(stopped_at.elapsed() >= Duration::from_secs(10));
        assert_eq!(hard_stops(&controller), 1);
    }

    #[tokio::test]
    async fn test_failed_shutdown_result_escalates_to_hard_stop() {
        let (server, controller) = setup();
        let mut client = MockManagementClient::new();
        client.expect_execute().times(1).returning(|_| {
            let (decision, _) = tokio::sync::oneshot::channel();
            Ok(PreparedOperation::new(
                OperationResponse::success(),
                decision,
                OperationFuture::ready(OperationResponse::failed("shutdown interrupted")),
            ))
        });
        drive_to_started(&server, Arc::new(client)).await;

        server.stop(Some(Duration::from_secs(30))).await;
        wait_for_hard_stop(&controller).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);
    }

    #[tokio::test]
    async fn test_stop_uses_configured_graceful_timeout() {
        let (server, controller) = setup();
        let client = Arc::new(StaticManagementClient::succeeding());
        server
            .start(boot().with_graceful_timeout(Duration::from_secs(20)))
            .await
            .unwrap();
        server.process_added().await;
        server.process_started().await;
        server.channel_registered(client.clone()).await;
        server.server_started().await;

        server.stop(None).await;
        assert_eq!(
            client.executed(),
            vec![ServerOperation::Shutdown { timeout_secs: 20 }]
        );
        assert_eq!(hard_stops(&controller), 0);
    }

    #[tokio::test]
    async fn test_destroy_skips_configured_graceful_timeout() {
        let (server, controller) = setup();
        let client = Arc::new(StaticManagementClient::succeeding());
        server
            .start(boot().with_graceful_timeout(Duration::from_secs(20)))
            .await
            .unwrap();
        server.process_added().await;
        server.process_started().await;
        server.channel_registered(client.clone()).await;
        server.server_started().await;

        server.destroy().await;
        assert!(client.executed().is_empty());
        let calls = controller.calls();
        assert!(matches!(calls[calls.len() - 2], ControllerCall::Stop(_)));
        assert!(matches!(calls[calls.len() - 1], ControllerCall::Destroy(_)));
    }

    #[tokio::test]
    async fn test_retired_server_refuses_to_start() {
        let (server, controller) = setup();
        let mut forgotten = false;
        assert!(server.retire(|| forgotten = true).await);
        assert!(forgotten);

        let err = server.start(boot()).await.unwrap_err();
        assert_eq!(err, DomainError::ServerRetired("server-one".to_string()));
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_started_server_is_not_retired() {
        let (server, _controller) = setup();
        server.start(boot()).await.unwrap();
        let mut forgotten = false;
        assert!(!server.retire(|| forgotten = true).await);
        assert!(!forgotten);
    }

    #[tokio::test]
    async fn test_graceful_stop_falls_back_to_hard_stop() {
        let (server, controller) = setup();
        let client = Arc::new(StaticManagementClient::new(StaticReply::Reject(
            "channel closed".to_string(),
        )));
        drive_to_started(&server, client.clone()).await;

        server.stop(Some(Duration::from_secs(30))).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopping);
        assert!(matches!(controller.calls().last(), Some(ControllerCall::Stop(_))));
    }

    #[tokio::test]
    async fn test_add_failure_rolls_back_and_fails() {
        let (server, controller) = setup();
        controller.fail(ProcessOperation::Add);

        server.start(boot()).await.unwrap();
        assert_eq!(server.internal_state(), InternalState::ProcessStopped);
        assert_eq!(server.required_state(), InternalState::Failed);
        assert_eq!(server.status(), ServerStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_server_can_be_started_again() {
        let (server, controller) = setup();
        controller.fail(ProcessOperation::Start);
        server.start(boot()).await.unwrap();
        server.process_added().await;
        assert_eq!(server.internal_state(), InternalState::ProcessAdded);
        assert_eq!(server.required_state(), InternalState::Failed);

        controller.clear_failures();
        server.start(boot()).await.unwrap();
        assert_eq!(server.internal_state(), InternalState::ProcessStarting);
        assert_eq!(server.status(), ServerStatus::Starting);
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let (server, _controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;

        server.process_finished(Duration::from_millis(500)).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopped);
        assert_eq!(server.status(), ServerStatus::Failed);
        assert!(!server.is_connected().await);
    }

    #[tokio::test]
    async fn test_exit_after_stop_cleans_up() {
        let (server, controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;
        server.stop(None).await;
        server.process_finished(Duration::from_secs(60)).await;

        assert_eq!(server.internal_state(), InternalState::ProcessRemoving);
        assert_eq!(server.required_state(), InternalState::Stopped);
        assert!(matches!(controller.calls().last(), Some(ControllerCall::Remove(_))));
    }

    #[tokio::test]
    async fn test_server_start_failed_keeps_process_running() {
        let (server, _controller) = setup();
        server.start(boot()).await.unwrap();
        server.process_added().await;
        server.process_started().await;
        server
            .channel_registered(Arc::new(StaticManagementClient::succeeding()))
            .await;
        server.server_start_failed().await;

        assert_eq!(server.internal_state(), InternalState::ServerStarted);
        assert_eq!(server.status(), ServerStatus::Failed);
    }

    #[tokio::test]
    async fn test_transition_failed_only_matches_current_state() {
        let (server, _controller) = setup();
        server.start(boot()).await.unwrap();

        server.transition_failed(InternalState::ProcessStarting).await;
        assert_eq!(server.internal_state(), InternalState::ProcessAdding);

        server.transition_failed(InternalState::ProcessAdding).await;
        assert_eq!(server.internal_state(), InternalState::ProcessStopped);
        assert_eq!(server.required_state(), InternalState::Failed);
    }

    #[tokio::test]
    async fn test_reload_cycle() {
        let (server, _controller) = setup();
        let client = Arc::new(StaticManagementClient::succeeding());
        drive_to_started(&server, client.clone()).await;

        assert!(server.reload(3, false).await);
        assert_eq!(server.internal_state(), InternalState::Reloading);
        assert_eq!(
            client.executed(),
            vec![ServerOperation::Reload {
                permit: 3,
                suspend: false
            }]
        );
        // Not fully started anymore
        assert!(!server.reload(4, false).await);

        server.channel_registered(client.clone()).await;
        assert_eq!(server.internal_state(), InternalState::ServerStarting);
        server.server_started().await;
        assert_eq!(server.status(), ServerStatus::Started);
    }

    #[tokio::test]
    async fn test_reload_refused_rolls_back() {
        let (server, _controller) = setup();
        let mut client = MockManagementClient::new();
        client.expect_execute().times(1).returning(|_| {
            Ok(PreparedOperation::completed(OperationResponse::failed(
                "reload in progress",
            )))
        });
        drive_to_started(&server, Arc::new(client)).await;

        assert!(!server.reload(1, false).await);
        assert_eq!(server.internal_state(), InternalState::ServerStarted);
        assert_eq!(server.status(), ServerStatus::Failed);
    }

    #[tokio::test]
    async fn test_suspend_requires_connection() {
        let (server, _controller) = setup();
        let err = server.suspend(None).await.unwrap_err();
        assert_eq!(err, DomainError::NotConnected("server-one".to_string()));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let (server, _controller) = setup();
        let client = Arc::new(StaticManagementClient::succeeding());
        drive_to_started(&server, client.clone()).await;

        let response = server
            .suspend(Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .wait(None)
            .await
            .unwrap();
        assert!(response.is_success());
        server.resume().await.unwrap().wait(None).await.unwrap();

        assert_eq!(
            client.executed(),
            vec![
                ServerOperation::Suspend {
                    timeout_secs: Some(5)
                },
                ServerOperation::Resume
            ]
        );
        assert_eq!(server.internal_state(), InternalState::ServerStarted);
    }

    #[tokio::test]
    async fn test_await_state_reaches_target() {
        let (server, _controller) = setup();
        server.start(boot()).await.unwrap();

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.await_state(InternalState::ServerStarted).await })
        };
        tokio::task::yield_now().await;
        server.process_added().await;
        server.process_started().await;
        server
            .channel_registered(Arc::new(StaticManagementClient::succeeding()))
            .await;
        server.server_started().await;

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_await_state_released_by_required_change() {
        let (server, _controller) = setup();
        server.start(boot()).await.unwrap();

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.await_state(InternalState::ServerStarted).await })
        };
        tokio::task::yield_now().await;
        server.stop(None).await;

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_await_state_released_by_failure() {
        let (server, controller) = setup();
        controller.fail(ProcessOperation::Start);
        server.start(boot()).await.unwrap();

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.await_state(InternalState::ServerStarted).await })
        };
        tokio::task::yield_now().await;
        server.process_added().await;

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_stops_then_destroys() {
        let (server, controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;

        server.destroy().await;
        let calls = controller.calls();
        let n = calls.len();
        assert!(matches!(calls[n - 2], ControllerCall::Stop(_)));
        assert!(matches!(calls[n - 1], ControllerCall::Destroy(_)));
    }

    #[tokio::test]
    async fn test_kill_on_stopped_server_is_noop() {
        let (server, controller) = setup();
        server.kill().await;
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unstable_flag_is_sticky_until_restart() {
        let (server, _controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;

        server.process_unstable().await;
        server.process_unstable().await;
        assert!(server.is_unstable());

        server.process_finished(Duration::from_millis(10)).await;
        server.start(boot()).await.unwrap();
        assert_eq!(server.internal_state(), InternalState::ProcessStarting);
        assert!(!server.is_unstable());
    }

    #[tokio::test]
    async fn test_callback_unregistered_rearms_reconnect() {
        let (server, controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;
        let token = server.auth_token().await;

        assert!(!server.callback_unregistered(false).await);
        assert_eq!(server.internal_state(), InternalState::SendStdin);
        assert!(!server.is_connected().await);

        let new_token = server.auth_token().await;
        assert_ne!(token, new_token);
        assert_eq!(
            controller.calls().last(),
            Some(&ControllerCall::Reconnect {
                process_name: "Server:server-one".to_string(),
                auth_token: new_token,
            })
        );
    }

    #[tokio::test]
    async fn test_callback_unregistered_while_shutting_down() {
        let (server, _controller) = setup();
        drive_to_started(&server, Arc::new(StaticManagementClient::succeeding())).await;
        assert!(server.callback_unregistered(true).await);
        assert_eq!(server.internal_state(), InternalState::ServerStarted);
    }

    #[tokio::test]
    async fn test_reconnect_server_process() {
        let (server, controller) = setup();
        server.reconnect_server_process(boot()).await;
        assert_eq!(server.internal_state(), InternalState::SendStdin);
        assert_eq!(server.status(), ServerStatus::Starting);
        assert!(matches!(
            controller.calls().as_slice(),
            [ControllerCall::Reconnect { .. }]
        ));
    }

    #[tokio::test]
    async fn test_adopt_stopping_and_dead_processes() {
        let (stopping, _) = setup();
        stopping.set_server_process_stopping().await;
        assert_eq!(stopping.internal_state(), InternalState::ProcessStopping);
        assert_eq!(stopping.status(), ServerStatus::Stopping);

        let (dead, controller) = setup();
        dead.remove_server_process().await;
        assert_eq!(dead.internal_state(), InternalState::ProcessRemoving);
        assert!(matches!(
            controller.calls().as_slice(),
            [ControllerCall::Remove(_)]
        ));
    }
}
