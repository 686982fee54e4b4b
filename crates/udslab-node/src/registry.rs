//! Registry client
//!
//! At startup a node announces itself to the external registry with one POST
//! to `<registry>/instances`. The registry stores the record and proxies
//! tester traffic to the node's listener; a rejected registration is fatal
//! for the instance.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::NodeError;

/// The record the registry stores for a reachable instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    /// `<network>:<address>`, e.g. `tcp:127.0.0.1:9009` or `unix:/run/x.sock`
    pub addr: String,
}

/// Announce `record` to the registry. Any non-2xx answer is an error.
pub async fn register_instance(registry_url: &str, record: &InstanceRecord) -> Result<(), NodeError> {
    let url = format!("{}/instances", registry_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(record)
        .send()
        .await
        .map_err(|e| NodeError::Registration(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(NodeError::RegistrationRejected {
            status: status.as_u16(),
        });
    }

    info!(id = %record.id, addr = %record.addr, "Registered with registry");
    Ok(())
}
