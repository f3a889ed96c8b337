//! InternalState value object
//! The position of a managed server in its lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed server.
///
/// The same type is used for the required state, which is restricted to
/// `Stopped`, `ServerStarted` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InternalState {
    /// No process is known to the process controller
    #[default]
    Stopped,

    /// Add request sent, waiting for the process-added notification
    ProcessAdding,

    /// Process registered with the process controller, not running
    ProcessAdded,

    /// Start request sent, waiting for the process-started notification
    ProcessStarting,

    /// OS process is running, boot descriptor not yet delivered
    ProcessStarted,

    /// Boot descriptor (or reconnect request) sent, waiting for the server
    /// to open its management channel
    SendStdin,

    /// Management channel open, waiting for the server-started notification
    ServerStarting,

    /// Server booted and reachable over its management channel
    ServerStarted,

    /// Reload sent, waiting for the server to re-register its channel
    Reloading,

    /// Stop dispatched, waiting for the process-stopped notification
    ProcessStopping,

    /// OS process exited, still registered with the process controller
    ProcessStopped,

    /// Remove request sent, waiting for the process-removed notification
    ProcessRemoving,

    /// Error marker, only ever held as a required state. A failed task
    /// rolls the internal state back to a concrete predecessor instead.
    Failed,
}

impl InternalState {
    /// Asynchronous states are only left through an external notification
    /// (or, for the stop shortcut, an explicit stop request).
    pub fn is_async(self) -> bool {
        matches!(
            self,
            InternalState::ProcessAdding
                | InternalState::ProcessStarting
                | InternalState::SendStdin
                | InternalState::ServerStarting
                | InternalState::Reloading
                | InternalState::ProcessStopping
                | InternalState::ProcessRemoving
        )
    }

    /// States that belong to the teardown path
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            InternalState::ProcessStopping
                | InternalState::ProcessStopped
                | InternalState::ProcessRemoving
        )
    }

    /// Compute the single next state for `(self, required)`.
    ///
    /// Returns `None` when there is no task to run. Completions of
    /// asynchronous states are driven by notifications, never by this table.
    pub fn next_state(self, required: InternalState) -> Option<InternalState> {
        use InternalState::*;

        match (self, required) {
            (Stopped, ServerStarted) => Some(ProcessAdding),

            (ProcessAdded, ServerStarted) => Some(ProcessStarting),
            (ProcessAdded, Stopped) => Some(ProcessRemoving),

            (ProcessStarted, ServerStarted) => Some(SendStdin),
            (ProcessStarted, Stopped) => Some(ProcessStopping),

            // Stop shortcut: no need to finish booting a server that is going away
            (SendStdin | ServerStarting | Reloading, Stopped) => Some(ProcessStopping),
            (ServerStarted, Stopped) => Some(ProcessStopping),

            (ProcessStopped, ServerStarted) => Some(ProcessStarting),
            (ProcessStopped, Stopped) => Some(ProcessRemoving),

            _ => None,
        }
    }

    /// The state a server falls back to when the task or notification for
    /// `self` failed. States that never run a task stay where they are.
    pub fn rollback_state(self) -> InternalState {
        use InternalState::*;

        match self {
            ProcessAdding => ProcessStopped,
            ProcessStarting => ProcessAdded,
            SendStdin | ServerStarting => ProcessStarted,
            Reloading => ServerStarted,
            ProcessStopping => ProcessStarted,
            ProcessRemoving => ProcessStopped,
            Stopped | ProcessAdded | ProcessStarted | ServerStarted | ProcessStopped | Failed => {
                self
            }
        }
    }
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InternalState::Stopped => "STOPPED",
            InternalState::ProcessAdding => "PROCESS_ADDING",
            InternalState::ProcessAdded => "PROCESS_ADDED",
            InternalState::ProcessStarting => "PROCESS_STARTING",
            InternalState::ProcessStarted => "PROCESS_STARTED",
            InternalState::SendStdin => "SEND_STDIN",
            InternalState::ServerStarting => "SERVER_STARTING",
            InternalState::ServerStarted => "SERVER_STARTED",
            InternalState::Reloading => "RELOADING",
            InternalState::ProcessStopping => "PROCESS_STOPPING",
            InternalState::ProcessStopped => "PROCESS_STOPPED",
            InternalState::ProcessRemoving => "PROCESS_REMOVING",
            InternalState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::InternalState::*;
    use super::*;

    const ALL: [InternalState; 13] = [
        Stopped,
        ProcessAdding,
        ProcessAdded,
        ProcessStarting,
        ProcessStarted,
        SendStdin,
        ServerStarting,
        ServerStarted,
        Reloading,
        ProcessStopping,
        ProcessStopped,
        ProcessRemoving,
        Failed,
    ];

    /// Successor reached through the notification that completes an async state.
    fn completion(state: InternalState) -> InternalState {
        match state {
            ProcessAdding => ProcessAdded,
            ProcessStarting => ProcessStarted,
            SendStdin | Reloading => ServerStarting,
            ServerStarting => ServerStarted,
            ProcessStopping => ProcessStopped,
            ProcessRemoving => Stopped,
            other => other,
        }
    }

    fn drive(mut state: InternalState, required: InternalState) -> Vec<InternalState> {
        let mut path = vec![state];
        for _ in 0..32 {
            let next = if state.is_async() {
                completion(state)
            } else {
                match state.next_state(required) {
                    Some(next) => next,
                    None => break,
                }
            };
            path.push(next);
            state = next;
        }
        path
    }

    #[test]
    fn test_start_path_reaches_server_started() {
        let path = drive(Stopped, ServerStarted);
        assert_eq!(
            path,
            vec![
                Stopped,
                ProcessAdding,
                ProcessAdded,
                ProcessStarting,
                ProcessStarted,
                SendStdin,
                ServerStarting,
                ServerStarted,
            ]
        );
    }

    #[test]
    fn test_every_state_converges_when_started() {
        for state in ALL {
            if state == Failed {
                continue;
            }
            let path = drive(state, ServerStarted);
            assert_eq!(
                *path.last().unwrap(),
                ServerStarted,
                "{state} should converge to SERVER_STARTED, got {path:?}"
            );
        }
    }

    #[test]
    fn test_every_state_converges_when_stopped() {
        for state in ALL {
            if state == Failed {
                continue;
            }
            let path = drive(state, Stopped);
            assert_eq!(
                *path.last().unwrap(),
                Stopped,
                "{state} should converge to STOPPED, got {path:?}"
            );
        }
    }

    #[test]
    fn test_stop_shortcut() {
        for state in [SendStdin, ServerStarting, ServerStarted, Reloading, ProcessStarted] {
            assert_eq!(state.next_state(Stopped), Some(ProcessStopping), "{state}");
        }
        // In-flight supervisor steps complete before a stop is routed
        assert_eq!(ProcessAdding.next_state(Stopped), None);
        assert_eq!(ProcessStarting.next_state(Stopped), None);
    }

    #[test]
    fn test_no_transitions_while_failed_is_required() {
        for state in ALL {
            assert_eq!(state.next_state(Failed), None, "{state}");
        }
    }

    #[test]
    fn test_table_targets_are_async() {
        for state in ALL {
            for required in [Stopped, ServerStarted] {
                if let Some(next) = state.next_state(required) {
                    assert!(next.is_async(), "{state} -> {next} should run a task");
                }
            }
        }
    }

    #[test]
    fn test_rollback_state() {
        assert_eq!(ProcessAdding.rollback_state(), ProcessStopped);
        assert_eq!(ProcessStarting.rollback_state(), ProcessAdded);
        assert_eq!(SendStdin.rollback_state(), ProcessStarted);
        assert_eq!(Reloading.rollback_state(), ServerStarted);
        assert_eq!(ProcessRemoving.rollback_state(), ProcessStopped);
        assert_eq!(ServerStarted.rollback_state(), ServerStarted);
    }

    #[test]
    fn test_rollback_never_produces_failed() {
        for state in ALL {
            if state.is_async() {
                assert_ne!(state.rollback_state(), Failed, "{state}");
                assert_ne!(state.rollback_state(), state, "{state}");
            }
        }
        for required in [Stopped, ServerStarted, Failed] {
            assert_eq!(Failed.next_state(required), None);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(SendStdin.to_string(), "SEND_STDIN");
        assert_eq!(ProcessRemoving.to_string(), "PROCESS_REMOVING");
        assert_eq!(InternalState::default(), Stopped);
    }
}
