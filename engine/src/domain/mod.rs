pub mod constants;
pub mod entities;
pub mod error;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use entities::{ManagedServer, ServerSnapshot, TransitionTask};
pub use error::{DomainError, Result};
pub use services::{
    InventoryMonitor, InventorySettings, ProcessEventListener, ServerFailure, ServerFailureReport,
    ServerInventory,
};
pub use value_objects::{
    BootDescriptor, InternalState, OperationResponse, Outcome, ProcessInfo, ServerBootConfiguration,
    ServerOperation, ServerStatus, is_server_process, server_name_of, server_process_name,
    validate_server_name,
};
