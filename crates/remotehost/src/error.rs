//! Error taxonomy surfaced to callers of [`RemoteHosted`](crate::RemoteHosted).

use std::time::Duration;

use crate::bridge::protocol::{FaultKind, RemoteFailure};
use crate::state::HostState;
use crate::supervisor::ExitInfo;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteHostError {
    /// The worker did not connect both channel endpoints in time.
    #[error("worker for session {session} did not connect within {timeout:?}")]
    ConnectionTimeout { session: String, timeout: Duration },

    /// Channel closed or worker exited while the operation was outstanding.
    #[error("connection to worker lost: {0}")]
    ConnectionLost(String),

    /// The hosted operation failed or panicked in the worker.
    #[error("remote operation failed: {message}")]
    Remote { message: String, panicked: bool },

    /// The call could not be bound to an operation (unknown name, arity, argument type).
    #[error("call rejected by worker ({kind}): {message}")]
    Dispatch { kind: FaultKind, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker could not resolve its serializer or construct its hosted type.
    #[error("worker startup failed: {0}")]
    StartupResolution(String),

    #[error("{0} used after dispose")]
    DisposedUse(&'static str),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: HostState,
    },

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker exited before completing the channel handshake.
    #[error("worker exited during startup ({0})")]
    WorkerExited(ExitInfo),

    #[error("call timed out after {0:?}")]
    CallTimeout(Duration),
}

impl From<RemoteFailure> for RemoteHostError {
    fn from(failure: RemoteFailure) -> Self {
        let message = failure.message;
        match failure.kind {
            kind if kind.is_dispatch() => Self::Dispatch { kind, message },
            FaultKind::StartupResolution => Self::StartupResolution(message),
            kind => Self::Remote {
                message,
                panicked: kind == FaultKind::Panic,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failure_maps_to_remote() {
        let err = RemoteHostError::from(RemoteFailure::new(FaultKind::Operation, "boom"));
        assert_eq!(
            err,
            RemoteHostError::Remote {
                message: "boom".into(),
                panicked: false
            }
        );
        assert_eq!(err.to_string(), "remote operation failed: boom");
    }

    #[test]
    fn panic_maps_to_panicked_remote() {
        let err = RemoteHostError::from(RemoteFailure::new(FaultKind::Panic, "operation panicked"));
        assert_eq!(
            err,
            RemoteHostError::Remote {
                message: "operation panicked".into(),
                panicked: true
            }
        );
    }

    #[test]
    fn binding_failures_map_to_dispatch() {
        for kind in [
            FaultKind::UnknownOperation,
            FaultKind::Arity,
            FaultKind::ArgumentType,
        ] {
            let err = RemoteHostError::from(RemoteFailure::new(kind, "x"));
            assert!(matches!(err, RemoteHostError::Dispatch { kind: k, .. } if k == kind));
        }
    }

    #[test]
    fn startup_fault_maps_to_startup_resolution() {
        let err = RemoteHostError::from(RemoteFailure::new(
            FaultKind::StartupResolution,
            "unknown serializer 'xml'",
        ));
        assert_eq!(
            err,
            RemoteHostError::StartupResolution("unknown serializer 'xml'".into())
        );
    }

    #[test]
    fn invalid_state_message() {
        let err = RemoteHostError::InvalidState {
            operation: "call",
            state: HostState::NotStarted,
        };
        assert_eq!(err.to_string(), "cannot call while NOT_STARTED");
    }
}
