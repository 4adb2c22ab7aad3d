//! Error types shared by the controller and worker sides.

use std::time::Duration;

use crate::bridge::protocol::{ActionKind, CorrelationId};

/// Worker bring-up failed. Fatal to that attempt; every caller waiting on it
/// receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    /// The host could not provide a worker context.
    #[error("failed to start worker: {0}")]
    Spawn(String),

    /// The engine raised during bootstrap.
    #[error("worker setup failed: {0}")]
    Worker(String),

    #[error("unexpected `{0}` message before the readiness signal")]
    UnexpectedMessage(String),

    #[error("worker exited before signalling readiness")]
    WorkerExited,

    #[error("transport error during setup: {0}")]
    Transport(String),

    #[error("worker setup timed out after {0:?}")]
    Timeout(Duration),
}

/// Bookkeeping disagreement between the two sides.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{action} response for unknown correlation id {id}")]
    UnknownCorrelationId { id: CorrelationId, action: ActionKind },

    #[error("correlation id {id} is already pending")]
    DuplicateCorrelationId { id: CorrelationId },

    #[error("response for correlation id {id} is {got}, expected {expected}")]
    ActionMismatch {
        id: CorrelationId,
        expected: ActionKind,
        got: ActionKind,
    },

    #[error("unknown function reference `{name}`")]
    UnknownFunction { name: String },
}

impl ProtocolError {
    /// Whether the channel can no longer be trusted to route responses.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownFunction { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The engine reported an error for this operation.
    #[error("{0}")]
    Execution(String),

    #[error(
        "interrupt requires memory shared between controller and worker, \
         which this worker context does not provide"
    )]
    InterruptUnsupported,

    #[error("function `{0}` is already registered by a pending exec")]
    FunctionNameConflict(String),

    #[error("worker channel closed")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_function_is_not_fatal() {
        assert!(
            !ProtocolError::UnknownFunction {
                name: "f".to_string()
            }
            .is_fatal()
        );
        assert!(
            ProtocolError::UnknownCorrelationId {
                id: 1,
                action: ActionKind::Exec
            }
            .is_fatal()
        );
    }

    #[test]
    fn display() {
        let err = BridgeError::from(ProtocolError::UnknownCorrelationId {
            id: 3,
            action: ActionKind::Complete,
        });
        assert_eq!(
            err.to_string(),
            "protocol error: complete response for unknown correlation id 3"
        );

        let err = BridgeError::from(SetupError::Worker("no engine".to_string()));
        assert_eq!(err.to_string(), "worker setup failed: no engine");
    }
}
