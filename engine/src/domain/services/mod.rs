pub mod fleet_operations;
pub mod process_event_listener;
pub mod server_inventory;

pub use fleet_operations::{ServerFailure, ServerFailureReport};
pub use process_event_listener::ProcessEventListener;
pub use server_inventory::{InventoryMonitor, InventorySettings, ServerInventory};
