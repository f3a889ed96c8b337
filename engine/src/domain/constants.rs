//! Domain Constants
//!
//! Common constants used throughout the domain layer

use std::time::Duration;

/// Prefix the process controller uses to namespace managed server processes
pub const SERVER_PROCESS_PREFIX: &str = "Server:";

/// Default time a caller waits on a single server during fleet-wide
/// suspend/resume, on top of the operation's own timeout
pub const DEFAULT_BLOCKING_TIMEOUT_SEC: u64 = 300;

/// How long to wait for the process controller to answer an inventory request
pub const DEFAULT_INVENTORY_TIMEOUT_SEC: u64 = 30;

/// Extra time granted to a graceful shutdown operation to be acknowledged
pub const GRACEFUL_SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL when destroying a process
pub const DESTROY_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Uptime under which the local process controller reports a process as unstable
pub const UNSTABLE_UPTIME: Duration = Duration::from_secs(2);
