pub mod managed_server;
pub mod transition;

pub use managed_server::{ManagedServer, ServerSnapshot};
pub use transition::TransitionTask;
