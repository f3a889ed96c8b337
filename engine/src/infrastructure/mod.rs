pub mod config;
#[cfg(unix)]
pub mod local_process_controller;

pub use config::{ServerConfig, load_server_configs};
#[cfg(unix)]
pub use local_process_controller::LocalProcessController;
