//! Configuration for envpool
//!
//! Everything comes from the environment, matching how the control plane is
//! deployed in-cluster. Missing variables fall back to defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The branch assumed when a request leaves it empty.
pub const DEFAULT_BRANCH: &str = "master";

/// A whitelisted repository, parsed from `REPO_WHITELIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub name: String,
    pub url: String,
    pub branch: String,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image tag used for the environment and provisioner containers.
    pub version: String,
    /// Number of slots in the pool.
    pub provision_count: usize,
    /// Kubernetes namespace for all environment objects.
    pub namespace: String,
    /// Docker storage driver passed to the environment containers.
    pub storage_driver: String,
    /// Host name under which environment URLs are exposed.
    pub node_host_name: String,
    /// Protocol for environment URLs (http or https).
    pub node_host_protocol: String,
    /// Optional node name the deployments are pinned to.
    pub node_name_override: String,
    /// PVC storage class; empty means host-path volumes.
    pub volume_storage_class: String,
    /// Size of the per-slot volume.
    pub provision_volume_size: String,
    /// Images the provisioner pre-pulls into the slot volume.
    pub provision_images: String,
    /// Allowed CORS origin.
    pub allow_origin: String,
    /// Repo whitelist; `None` disables whitelisting entirely.
    pub whitelist: Option<Vec<WhitelistEntry>>,
    pub github_client_id: String,
    pub github_client_secret: String,
    /// Kubernetes API target; empty host means in-cluster defaults.
    pub kube_protocol: String,
    pub kube_host: String,
    pub kube_port: String,
    /// Path of the service account token file.
    pub kube_token_path: String,
    /// Directory the manifest templates are loaded from.
    pub template_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "latest".to_string(),
            provision_count: 1,
            namespace: "default".to_string(),
            storage_driver: "aufs".to_string(),
            node_host_name: String::new(),
            node_host_protocol: "http".to_string(),
            node_name_override: String::new(),
            volume_storage_class: String::new(),
            provision_volume_size: String::new(),
            provision_images: String::new(),
            allow_origin: String::new(),
            whitelist: None,
            github_client_id: String::new(),
            github_client_secret: String::new(),
            kube_protocol: "https".to_string(),
            kube_host: String::new(),
            kube_port: String::new(),
            kube_token_path: String::new(),
            template_dir: PathBuf::from("templates"),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(version) = env_nonempty("VERSION") {
            config.version = version;
        }
        if let Ok(count) = env("PROVISION_COUNT").parse::<usize>() {
            config.provision_count = count;
        }
        if let Some(namespace) = env_nonempty("NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(driver) = env_nonempty("STORAGE_DRIVER") {
            config.storage_driver = driver;
        }
        config.node_host_name = env("NODE_HOST_NAME");
        if let Some(protocol) = env_nonempty("NODE_HOST_PROTOCOL") {
            config.node_host_protocol = protocol;
        }
        config.node_name_override = env("NODE_NAME_OVERRIDE");
        config.volume_storage_class = env("VOLUME_STORAGE_CLASS");
        config.provision_volume_size = env("PROVISION_VOLUME_SIZE");
        config.provision_images = env("PROVISION_IMAGES");
        config.allow_origin = env("ALLOW_ORIGIN");
        config.whitelist = parse_whitelist(&env("REPO_WHITELIST"));
        config.github_client_id = env("GITHUB_CLIENT_ID");
        config.github_client_secret = env("GITHUB_CLIENT_SECRET");
        if let Some(protocol) = env_nonempty("KUBERNETES_SERVICE_PROTOCOL") {
            config.kube_protocol = protocol.trim_end_matches("://").to_string();
        }
        config.kube_host = env("KUBERNETES_SERVICE_HOST");
        config.kube_port = env("KUBERNETES_SERVICE_PORT");
        config.kube_token_path = env("KUBERNETES_TOKEN_PATH");
        if let Some(dir) = env_nonempty("TEMPLATE_DIR") {
            config.template_dir = PathBuf::from(dir);
        }
        config
    }

    /// Host-path persistent volumes are used when no storage class is set.
    pub fn host_path_volumes(&self) -> bool {
        self.volume_storage_class.is_empty()
    }

    /// GitHub OAuth is enabled when both client id and secret are set.
    pub fn github_auth_enabled(&self) -> bool {
        !self.github_client_id.is_empty() && !self.github_client_secret.is_empty()
    }

    /// Check a `(repo, branch)` pair against the whitelist.
    ///
    /// A missing whitelist allows everything.
    pub fn repo_whitelisted(&self, repo: &str, branch: &str) -> bool {
        match &self.whitelist {
            None => true,
            Some(entries) => entries
                .iter()
                .any(|e| e.url == repo && e.branch == branch),
        }
    }
}

/// Parse the `name|url|branch,…` whitelist string.
///
/// A one-field element uses the value as both name and url; a missing
/// branch defaults to `master`. An empty string disables the whitelist.
pub fn parse_whitelist(raw: &str) -> Option<Vec<WhitelistEntry>> {
    if raw.is_empty() {
        return None;
    }
    let entries = raw
        .split(',')
        .map(|element| {
            let fields: Vec<&str> = element.split('|').collect();
            if fields.len() >= 2 {
                WhitelistEntry {
                    name: fields[0].to_string(),
                    url: fields[1].to_string(),
                    branch: fields
                        .get(2)
                        .map_or_else(|| DEFAULT_BRANCH.to_string(), |b| (*b).to_string()),
                }
            } else {
                WhitelistEntry {
                    name: element.to_string(),
                    url: element.to_string(),
                    branch: DEFAULT_BRANCH.to_string(),
                }
            }
        })
        .collect();
    Some(entries)
}

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
