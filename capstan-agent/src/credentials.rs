//! Operation-scoped agent credentials.
//!
//! The controller mints one bearer token per operation. Each deployment
//! profile carries an agent URL of the form `https://host:port?token=…`;
//! peers authenticate every inbound call against the embedded token.

use std::net::IpAddr;

use url::Url;
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Mint a fresh operation-scoped bearer token.
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A parsed agent endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUrl {
    /// Peer host.
    pub host: String,
    /// Peer port.
    pub port: u16,
    /// Operation-scoped bearer token.
    pub token: String,
}

impl AgentUrl {
    /// Build the canonical URL for a peer.
    pub fn new(host: IpAddr, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            token: token.into(),
        }
    }

    /// Parse an agent URL, extracting the embedded token.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| AgentError::InvalidUrl {
            url: raw.to_string(),
            cause: e.to_string(),
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| AgentError::InvalidUrl {
                url: raw.to_string(),
                cause: "missing host".into(),
            })?
            .to_string();
        let port = url.port().ok_or_else(|| AgentError::InvalidUrl {
            url: raw.to_string(),
            cause: "missing port".into(),
        })?;
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| AgentError::InvalidUrl {
                url: raw.to_string(),
                cause: "missing token parameter".into(),
            })?;
        Ok(Self { host, port, token })
    }

    /// The dialable endpoint. Tokens authenticate calls; transport-level
    /// TLS is the deployment's concern, not the fabric's.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for AgentUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "https://{}:{}?token={}", self.host, self.port, self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_trip() {
        let url = AgentUrl::new("10.0.0.7".parse().unwrap(), 3012, "s3cret");
        let parsed = AgentUrl::parse(&url.to_string()).unwrap();
        assert_eq!(parsed, url);
        assert_eq!(parsed.endpoint(), "http://10.0.0.7:3012");
    }

    #[test]
    fn missing_token_rejected() {
        let err = AgentUrl::parse("https://10.0.0.7:3012").unwrap_err();
        assert!(err.to_string().contains("missing token"));
    }

    #[test]
    fn minted_tokens_are_unique() {
        assert_ne!(mint_token(), mint_token());
    }
}
