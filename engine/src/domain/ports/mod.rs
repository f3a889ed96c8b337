pub mod management_client;
pub mod mock_process_controller;
pub mod process_controller;

pub use management_client::{
    ManagementClient, OperationCompleter, OperationFuture, PreparedOperation,
    StaticManagementClient, StaticReply,
};
pub use mock_process_controller::{ControllerCall, MockProcessController};
pub use process_controller::{
    AddProcessRequest, ProcessControllerClient, ProcessEvent, ProcessOperation, StdinSink,
};

#[cfg(test)]
pub use management_client::MockManagementClient;
