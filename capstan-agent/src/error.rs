//! Error types for the agent fabric.

use capstan_core::CoreError;
use thiserror::Error;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the agent fabric.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to establish a connection to a peer.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A peer rejected or failed an RPC.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// An agent URL could not be parsed.
    #[error("invalid agent url {url}: {cause}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Reason it was rejected.
        cause: String,
    },

    /// A wire payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Core error raised by dispatched phase work.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<AgentError> for CoreError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Core(core) => core,
            // A dispatched phase reports its own failure through the
            // stream's terminal status; everything else is fabric trouble
            // and retryable by the engine.
            AgentError::Rpc(status) if status.code() == tonic::Code::Internal => {
                CoreError::fatal(status.message().to_string())
            }
            AgentError::Rpc(status)
                if status.code() == tonic::Code::FailedPrecondition =>
            {
                CoreError::PreconditionFailed {
                    reason: status.message().to_string(),
                }
            }
            AgentError::Rpc(status) if status.code() == tonic::Code::Cancelled => {
                CoreError::Aborted
            }
            other => CoreError::transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_unavailable_maps_to_transport() {
        let err: CoreError = AgentError::Rpc(tonic::Status::unavailable("dial refused")).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn cancelled_maps_to_aborted() {
        let err: CoreError = AgentError::Rpc(tonic::Status::cancelled("client gone")).into();
        assert!(err.is_aborted());
    }
}
