//! Manifest templates and placeholder substitution
//!
//! Manifests are produced by plain, global string substitution of a fixed
//! placeholder set into templates loaded once at startup. There is no
//! expression language. Substitution order matters where one placeholder is
//! a prefix of another: the credentialed repo URL must be substituted
//! before the plain one, and the platform port before the platform.

use std::path::Path;

use anyhow::{Context, Result};

pub const VAR_PV_NAME: &str = "$pvName";
pub const VAR_PV_SIZE: &str = "$pvSize";
pub const VAR_PV_PATH: &str = "$pvPath";
pub const VAR_PVC_NAME: &str = "$pvcName";
pub const VAR_PVC_STORAGE_CLASS: &str = "$pvcStorageClass";
pub const VAR_SERVICE_NAME: &str = "$serviceName";
pub const VAR_DEPLOYMENT_NAME: &str = "$deploymentName";
pub const VAR_APP_LABEL: &str = "$appLabel";
pub const VAR_CLAIM_TOKEN: &str = "$claimToken";
pub const VAR_GIT_REPO_WITH_CREDS: &str = "$gitRepoWithCreds";
pub const VAR_GIT_REPO: &str = "$gitRepo";
pub const VAR_GIT_BRANCH: &str = "$gitBranch";
pub const VAR_ENV_DETAILS: &str = "$envDetails";
pub const VAR_ENV_VARS: &str = "$envVars";
pub const VAR_STORAGE_DRIVER: &str = "$storageDriver";
pub const VAR_LOG_PORT: &str = "$logPort";
pub const VAR_EDITOR_PORT: &str = "$editorPort";
pub const VAR_PROXY_PORT: &str = "$proxyPort";
pub const VAR_ALLOW_ORIGIN: &str = "$allowOrigin";
pub const VAR_JOB_NAME: &str = "$jobName";
pub const VAR_PROVISION_IMAGES: &str = "$provisionImages";
pub const VAR_VERSION: &str = "$minienvVersion";
pub const VAR_NODE_NAME_OVERRIDE: &str = "$minienvNodeNameOverride";
pub const VAR_NODE_HOST_PROTOCOL: &str = "$minienvNodeHostProtocol";
pub const VAR_PLATFORM_PORT: &str = "$minienvPlatformPort";
pub const VAR_PLATFORM: &str = "$minienvPlatform";

/// Substitute `(placeholder, value)` pairs into a template, in order,
/// replacing every occurrence of each placeholder.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (placeholder, value) in vars {
        rendered = rendered.replace(placeholder, value);
    }
    rendered
}

/// The manifest templates, loaded once at startup.
///
/// A missing or unreadable template file is fatal: the control plane cannot
/// deploy anything without them.
#[derive(Debug, Clone)]
pub struct Templates {
    /// Host-path PV template; absent when a storage class is configured.
    pub env_pv: Option<String>,
    pub env_pvc: String,
    pub env_deployment: String,
    pub env_service: String,
    pub provisioner_job: String,
}

impl Templates {
    pub fn load(dir: &Path, host_path_volumes: bool) -> Result<Self> {
        let env_pv = if host_path_volumes {
            Some(load_template(dir, "env-pv-host-path.yml")?)
        } else {
            None
        };
        let env_pvc = if host_path_volumes {
            load_template(dir, "env-pvc-host-path.yml")?
        } else {
            load_template(dir, "env-pvc-storage-class.yml")?
        };
        Ok(Self {
            env_pv,
            env_pvc,
            env_deployment: load_template(dir, "env-deployment.yml")?,
            env_service: load_template(dir, "env-service.yml")?,
            provisioner_job: load_template(dir, "provisioner-job.yml")?,
        })
    }
}

fn load_template(dir: &Path, file: &str) -> Result<String> {
    let path = dir.join(file);
    std::fs::read_to_string(&path)
        .with_context(|| format!("reading template {}", path.display()))
}
