pub mod boot_configuration;
pub mod internal_state;
pub mod process_info;
pub mod server_operation;
pub mod server_status;

pub use boot_configuration::{BootDescriptor, ServerBootConfiguration};
pub use internal_state::InternalState;
pub use process_info::{
    ProcessInfo, is_server_process, server_name_of, server_process_name, validate_server_name,
};
pub use server_operation::{OperationResponse, Outcome, ServerOperation};
pub use server_status::ServerStatus;
