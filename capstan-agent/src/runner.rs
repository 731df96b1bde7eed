//! The agent runner: the controller-side half of the fabric.
//!
//! Dials peer agents with operation-scoped credentials, keeps one channel
//! per peer and reuses it for every phase targeting that peer, and tears
//! the group down collectively when the operation ends.

use std::net::IpAddr;

use capstan_core::error::aggregate;
use capstan_core::{ClusterServer, CoreError, ProgressEntry};
use dashmap::DashMap;
use parking_lot::Mutex;
use tonic::metadata::MetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use crate::credentials::AgentUrl;
use crate::error::{AgentError, Result};
use crate::proto::agent_service_client::AgentServiceClient;
use crate::proto::{AgentStatus, Empty, PhaseRequest};
use crate::server::PhaseAssignment;

type AgentClient = AgentServiceClient<InterceptedService<Channel, AttachToken>>;

/// Adds the operation token to every outbound call.
#[derive(Clone)]
struct AttachToken {
    header: MetadataValue<tonic::metadata::Ascii>,
}

impl Interceptor for AttachToken {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.header.clone());
        Ok(request)
    }
}

/// Controller-side handle to the fleet of peer agents for one operation.
pub struct AgentRunner {
    token: String,
    /// Peers in registration order; teardown walks them in reverse.
    peers: Mutex<Vec<(IpAddr, AgentUrl)>>,
    /// One dialed channel per peer, reused for all phases.
    clients: DashMap<IpAddr, AgentClient>,
}

impl AgentRunner {
    /// Create a runner using the operation's bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            peers: Mutex::new(Vec::new()),
            clients: DashMap::new(),
        }
    }

    /// The operation token peers were deployed with.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Register a peer agent listening on `port` of the server's
    /// advertise address.
    pub fn add_peer(&self, server: &ClusterServer, port: u16) {
        let url = AgentUrl::new(server.advertise_ip, port, self.token.clone());
        self.add_peer_url(server.advertise_ip, url);
    }

    /// Register a peer agent by its full URL (profile-provided).
    pub fn add_peer_url(&self, advertise_ip: IpAddr, url: AgentUrl) {
        let mut peers = self.peers.lock();
        if !peers.iter().any(|(ip, _)| *ip == advertise_ip) {
            peers.push((advertise_ip, url));
        }
    }

    /// Registered peer addresses in registration order.
    pub fn peers(&self) -> Vec<IpAddr> {
        self.peers.lock().iter().map(|(ip, _)| *ip).collect()
    }

    async fn client_for(&self, advertise_ip: IpAddr) -> Result<AgentClient> {
        if let Some(client) = self.clients.get(&advertise_ip) {
            return Ok(client.clone());
        }
        let url = {
            let peers = self.peers.lock();
            peers
                .iter()
                .find(|(ip, _)| *ip == advertise_ip)
                .map(|(_, url)| url.clone())
        }
        .ok_or_else(|| {
            AgentError::Core(CoreError::NotFound {
                what: format!("agent for {advertise_ip}"),
            })
        })?;

        let channel = Endpoint::from_shared(url.endpoint())
            .map_err(|e| AgentError::InvalidUrl {
                url: url.endpoint(),
                cause: e.to_string(),
            })?
            .connect()
            .await?;
        let header = MetadataValue::try_from(format!("Bearer {}", url.token))
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        let client = AgentServiceClient::with_interceptor(channel, AttachToken { header });
        self.clients.insert(advertise_ip, client.clone());
        Ok(client)
    }

    /// Dispatch one phase to the agent on `server`, forwarding progress
    /// entries as they arrive. Returns once the remote work finishes; a
    /// terminal stream error carries the remote failure.
    pub async fn dispatch<F>(
        &self,
        server: &ClusterServer,
        assignment: PhaseAssignment,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(ProgressEntry) + Send,
    {
        let mut client = self.client_for(server.advertise_ip).await?;
        let data = serde_json::to_vec(&assignment)?;
        let mut stream = client
            .dispatch(PhaseRequest { data })
            .await?
            .into_inner();
        while let Some(frame) = stream.message().await? {
            match serde_json::from_slice::<ProgressEntry>(&frame.data) {
                Ok(entry) => on_progress(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable progress frame");
                }
            }
        }
        Ok(())
    }

    /// Probe an agent's status.
    pub async fn status(&self, server: &ClusterServer) -> Result<AgentStatus> {
        let mut client = self.client_for(server.advertise_ip).await?;
        Ok(client.status(Empty {}).await?.into_inner())
    }

    /// Cooperatively stop every agent in the group, newest first.
    /// Idempotent; errors are aggregated and never short-circuit.
    pub async fn stop_group(&self) -> capstan_core::Result<()> {
        self.teardown(false).await
    }

    /// Forcibly abort every agent in the group, newest first.
    /// Idempotent; errors are aggregated and never short-circuit.
    pub async fn abort_group(&self) -> capstan_core::Result<()> {
        self.teardown(true).await
    }

    async fn teardown(&self, abort: bool) -> capstan_core::Result<()> {
        let mut targets: Vec<IpAddr> = self.peers();
        targets.reverse();
        let mut errors = Vec::new();
        for ip in targets {
            let result = async {
                let mut client = self.client_for(ip).await?;
                if abort {
                    client.abort(Empty {}).await?;
                } else {
                    client.stop(Empty {}).await?;
                }
                Ok::<_, AgentError>(())
            }
            .await;
            if let Err(err) = result {
                tracing::warn!(peer = %ip, abort, error = %err, "agent teardown failed");
                errors.push(err.into());
            }
        }
        aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::ServerRole;

    fn server(ip: &str) -> ClusterServer {
        ClusterServer {
            advertise_ip: ip.parse().unwrap(),
            hostname: format!("node-{ip}"),
            role: ServerRole::Master,
            profile: "master".into(),
        }
    }

    #[test]
    fn peers_register_once_in_order() {
        let runner = AgentRunner::new("tok");
        runner.add_peer(&server("10.0.0.1"), 3012);
        runner.add_peer(&server("10.0.0.2"), 3012);
        runner.add_peer(&server("10.0.0.1"), 3012);
        let peers = runner.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "10.0.0.1");
        assert_eq!(peers[1].to_string(), "10.0.0.2");
    }

    #[tokio::test]
    async fn dispatch_to_unknown_peer_fails() {
        let runner = AgentRunner::new("tok");
        let err = runner
            .dispatch(
                &server("10.9.9.9"),
                PhaseAssignment {
                    operation_key: capstan_core::OperationKey::new("a", "c", "op"),
                    phase_id: "update-config/validate".into(),
                    executor: "config/validate".into(),
                    data: None,
                    rollback: false,
                },
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
