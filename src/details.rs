//! Deployment details persisted alongside the environment
//!
//! The details record is serialised to JSON and stored inside the
//! deployment's pod-template annotations, with embedded double-quotes
//! escaped so the blob survives substitution into a YAML manifest. A
//! restarted control plane re-hydrates its slots from these annotations.

use serde::{Deserialize, Serialize};

/// A browser-facing entry point for one exposed port of the user's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub path: String,
}

impl Tab {
    /// A tab named after its port, as derived from a Compose `ports` entry.
    pub fn for_port(port: u16) -> Self {
        Self {
            port,
            name: port.to_string(),
            url: String::new(),
            path: String::new(),
        }
    }
}

/// Everything a client needs to reach a running environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDetails {
    pub node_host_name: String,
    pub env_id: String,
    pub claim_token: String,
    pub log_url: String,
    pub editor_url: String,
    pub tabs: Vec<Tab>,
}

/// Serialise details for embedding in a YAML annotation value.
pub fn details_to_string(details: &DeploymentDetails) -> String {
    serde_json::to_string(details)
        .map(|s| s.replace('"', "\\\""))
        .unwrap_or_default()
}

/// Inverse of [`details_to_string`]; `None` when the blob does not decode.
pub fn details_from_string(raw: &str) -> Option<DeploymentDetails> {
    serde_json::from_str(&raw.replace("\\\"", "\"")).ok()
}
