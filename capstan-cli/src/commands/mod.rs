pub mod agent;
pub mod config;
pub mod plan;

use std::path::PathBuf;

use anyhow::{bail, Result};
use capstan_core::OperationKey;

/// Default controller socket location.
pub fn default_socket() -> PathBuf {
    std::env::temp_dir().join("capstan.sock")
}

/// Parse an `account/cluster/operation-id` key.
pub fn plan_key(raw: &str) -> Result<OperationKey> {
    let parts: Vec<&str> = raw.split('/').collect();
    let [account, cluster, id] = parts.as_slice() else {
        bail!("operation key must be account/cluster/operation-id, got {raw:?}");
    };
    Ok(OperationKey::new(*account, *cluster, *id))
}
