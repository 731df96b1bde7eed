//! Agent fabric for the capstan operation controller.
//!
//! Two halves: a [`PeerAgent`] runs on each node as an RPC service for the
//! duration of an operation, and an [`AgentRunner`] on the controller
//! dials peers with operation-scoped credentials, multiplexes phase
//! dispatch over cached channels, and tears the group down collectively.

pub mod credentials;
pub mod error;
pub mod runner;
pub mod server;

/// Generated wire types for the agent service.
pub mod proto {
    tonic::include_proto!("capstan.agent");
}

pub use credentials::{mint_token, AgentUrl};
pub use error::{AgentError, Result};
pub use runner::AgentRunner;
pub use server::{HandlerFuture, PeerAgent, PeerConfig, PhaseAssignment, PhaseHandler};

/// Default port peer agents listen on.
pub const DEFAULT_AGENT_PORT: u16 = 3012;
