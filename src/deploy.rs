//! Environment deploy pipeline
//!
//! Materialises a slot into running Kubernetes objects: teardown of the
//! previous environment, descriptor/Compose resolution, PV/PVC ensure,
//! Service, then Deployment. The service is applied before the deployment
//! so the URLs serialised into the recovery annotations are stable. The
//! provisioner job that pre-pulls images into a slot's volume lives here
//! too.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use tracing::{info, warn};

use crate::cluster::{self, ClusterStore};
use crate::config::Config;
use crate::descriptor::{self, EnvDescriptor};
use crate::details::{details_to_string, DeploymentDetails, Tab};
use crate::repo::{url_with_credentials, RepoCredentials, RepoFetcher};
use crate::template::{self, substitute, Templates};

pub const DEFAULT_LOG_PORT: &str = "8001";
pub const DEFAULT_EDITOR_PORT: &str = "8002";
pub const DEFAULT_PROXY_PORT: &str = "8003";

/// Emitted literally into every environment URL; the in-pod entrypoint
/// resolves it to the per-session id.
const SESSION_ID_PLACEHOLDER: &str = "$sessionId";

const POD_PHASE_SUCCEEDED: &str = "Succeeded";
const POD_PHASE_FAILED: &str = "Failed";

const POD_TERMINATION_POLLS: u32 = 30;
const POD_TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Inputs for deploying one slot.
#[derive(Debug)]
pub struct DeployRequest<'a> {
    pub env_id: &'a str,
    pub claim_token: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub creds: &'a RepoCredentials,
    pub env_vars: &'a BTreeMap<String, String>,
}

/// Whether the slot's deployment currently exists in the cluster.
pub async fn is_env_deployed(store: &dyn ClusterStore, env_id: &str) -> Result<bool> {
    Ok(store
        .get_deployment(&cluster::env_deployment_name(env_id))
        .await?
        .is_some())
}

/// Delete the slot's Deployment, ReplicaSets and Service, then wait for its
/// pods to terminate.
///
/// The service and replica-set names are claim-scoped; the live
/// deployment's `claimToken` annotation is preferred over the caller's
/// token so objects left by an earlier claim are still found.
pub async fn teardown_env(
    store: &dyn ClusterStore,
    env_id: &str,
    claim_token: Option<&str>,
) -> Result<()> {
    let deployment_name = cluster::env_deployment_name(env_id);
    let live_token = match store.get_deployment(&deployment_name).await {
        Ok(deployment) => deployment.as_ref().and_then(|d| {
            cluster::pod_template_annotation(d, cluster::ANNOTATION_CLAIM_TOKEN)
                .map(str::to_string)
        }),
        Err(_) => None,
    };
    let token = live_token.or_else(|| claim_token.map(str::to_string));
    info!(env_id = %env_id, "deleting environment");
    store.delete_deployment(&deployment_name).await?;
    if let Some(token) = token {
        let app_label = cluster::env_app_label(env_id, &token);
        store.delete_replica_sets(&app_label).await?;
        store
            .delete_service(&cluster::env_service_name(env_id, &token))
            .await?;
        wait_for_pod_termination(store, &app_label).await?;
    }
    Ok(())
}

/// Deploy an environment for a claimed slot and return its details.
pub async fn deploy_env(
    store: &dyn ClusterStore,
    fetcher: &dyn RepoFetcher,
    templates: &Templates,
    config: &Config,
    request: &DeployRequest<'_>,
) -> Result<DeploymentDetails> {
    teardown_env(store, request.env_id, Some(request.claim_token)).await?;

    let descriptor =
        descriptor::download_descriptor(fetcher, request.repo, request.branch, request.creds)
            .await?;
    let platform = descriptor
        .as_ref()
        .map(|d| d.platform().to_string())
        .unwrap_or_default();
    let mut tabs = if platform.is_empty() {
        let compose =
            descriptor::download_compose(fetcher, request.repo, request.branch, request.creds)
                .await?;
        descriptor::compose_tabs(&compose)
    } else {
        Vec::new()
    };
    if let Some(descriptor) = &descriptor {
        descriptor::apply_proxy_overrides(&mut tabs, descriptor);
    }

    let pvc_name = ensure_volumes(store, templates, config, request.env_id).await?;

    let app_label = cluster::env_app_label(request.env_id, request.claim_token);
    let service_name = cluster::env_service_name(request.env_id, request.claim_token);
    let service = substitute(
        &templates.env_service,
        &[
            (template::VAR_SERVICE_NAME, service_name.as_str()),
            (template::VAR_APP_LABEL, app_label.as_str()),
            (template::VAR_LOG_PORT, DEFAULT_LOG_PORT),
            (template::VAR_EDITOR_PORT, DEFAULT_EDITOR_PORT),
            (template::VAR_PROXY_PORT, DEFAULT_PROXY_PORT),
        ],
    );
    store
        .save_service(serde_yaml::from_str(&service).context("decoding rendered service")?)
        .await?;

    let details = build_details(
        config,
        request.env_id,
        request.claim_token,
        descriptor.as_ref(),
        tabs,
    );

    let platform_port = descriptor
        .as_ref()
        .and_then(EnvDescriptor::first_proxy_port)
        .map_or_else(|| DEFAULT_PROXY_PORT.to_string(), |p| p.to_string());
    let deployment_name = cluster::env_deployment_name(request.env_id);
    let repo_with_creds = url_with_credentials(request.repo, request.creds);
    let env_vars_yaml = render_env_vars(request.env_vars);
    let details_blob = details_to_string(&details);
    // ordering matters: the credentialed repo URL and the platform port are
    // substituted before the placeholders they prefix
    let deployment = substitute(
        &templates.env_deployment,
        &[
            (
                template::VAR_NODE_NAME_OVERRIDE,
                config.node_name_override.as_str(),
            ),
            (
                template::VAR_NODE_HOST_PROTOCOL,
                config.node_host_protocol.as_str(),
            ),
            (template::VAR_VERSION, config.version.as_str()),
            (template::VAR_PLATFORM_PORT, platform_port.as_str()),
            (template::VAR_PLATFORM, platform.as_str()),
            (template::VAR_DEPLOYMENT_NAME, deployment_name.as_str()),
            (template::VAR_APP_LABEL, app_label.as_str()),
            (template::VAR_CLAIM_TOKEN, request.claim_token),
            (template::VAR_GIT_REPO_WITH_CREDS, repo_with_creds.as_str()),
            (template::VAR_GIT_REPO, request.repo),
            (template::VAR_GIT_BRANCH, request.branch),
            (template::VAR_ENV_DETAILS, details_blob.as_str()),
            (template::VAR_ENV_VARS, env_vars_yaml.as_str()),
            (template::VAR_STORAGE_DRIVER, config.storage_driver.as_str()),
            (template::VAR_LOG_PORT, DEFAULT_LOG_PORT),
            (template::VAR_EDITOR_PORT, DEFAULT_EDITOR_PORT),
            (template::VAR_PROXY_PORT, DEFAULT_PROXY_PORT),
            (template::VAR_ALLOW_ORIGIN, config.allow_origin.as_str()),
            (template::VAR_PVC_NAME, pvc_name.as_str()),
        ],
    );
    store
        .save_deployment(serde_yaml::from_str(&deployment).context("decoding rendered deployment")?)
        .await?;
    info!(env_id = %request.env_id, repo = %request.repo, "environment deployed");
    Ok(details)
}

/// Deploy the provisioner job that pre-pulls images into the slot's volume.
pub async fn deploy_provisioner(
    store: &dyn ClusterStore,
    templates: &Templates,
    config: &Config,
    env_id: &str,
) -> Result<()> {
    delete_provisioner(store, env_id).await?;
    let pvc_name = ensure_volumes(store, templates, config, env_id).await?;
    let job_name = cluster::provisioner_job_name(env_id);
    let app_label = cluster::provisioner_app_label(env_id);
    let job = substitute(
        &templates.provisioner_job,
        &[
            (template::VAR_VERSION, config.version.as_str()),
            (template::VAR_JOB_NAME, job_name.as_str()),
            (template::VAR_APP_LABEL, app_label.as_str()),
            (template::VAR_STORAGE_DRIVER, config.storage_driver.as_str()),
            (
                template::VAR_PROVISION_IMAGES,
                config.provision_images.as_str(),
            ),
            (template::VAR_PVC_NAME, pvc_name.as_str()),
        ],
    );
    store
        .save_job(serde_yaml::from_str(&job).context("decoding rendered provisioner job")?)
        .await?;
    info!(env_id = %env_id, "provisioner deployed");
    Ok(())
}

/// Delete the provisioner job and any of its pods.
pub async fn delete_provisioner(store: &dyn ClusterStore, env_id: &str) -> Result<()> {
    store
        .delete_job(&cluster::provisioner_job_name(env_id))
        .await?;
    for pod in store
        .list_pods(&cluster::provisioner_app_label(env_id))
        .await?
    {
        if let Some(name) = pod.metadata.name.as_deref() {
            store.delete_pod(name).await?;
        }
    }
    Ok(())
}

/// Whether any provisioner pod for the slot is still in a non-terminal
/// phase. `Succeeded` and `Failed` count as terminal; an unknown phase does
/// not.
pub async fn is_provisioner_running(store: &dyn ClusterStore, env_id: &str) -> Result<bool> {
    let pods = store
        .list_pods(&cluster::provisioner_app_label(env_id))
        .await?;
    Ok(pods.iter().any(|pod| !pod_terminal(pod)))
}

fn pod_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some(POD_PHASE_SUCCEEDED | POD_PHASE_FAILED)
    )
}

/// Ensure the slot's PV (host-path storage only) and PVC exist; both are
/// created only when absent. Returns the PVC name.
async fn ensure_volumes(
    store: &dyn ClusterStore,
    templates: &Templates,
    config: &Config,
    env_id: &str,
) -> Result<String> {
    if config.host_path_volumes() {
        let pv_name = cluster::env_pv_name(env_id);
        if store.get_persistent_volume(&pv_name).await?.is_none() {
            let pv_path = cluster::env_pv_path(env_id);
            let pv_template = templates
                .env_pv
                .as_ref()
                .context("host-path volume template not loaded")?;
            let manifest = substitute(
                pv_template,
                &[
                    (template::VAR_PV_NAME, pv_name.as_str()),
                    (
                        template::VAR_PV_SIZE,
                        config.provision_volume_size.as_str(),
                    ),
                    (template::VAR_PV_PATH, pv_path.as_str()),
                ],
            );
            store
                .save_persistent_volume(
                    serde_yaml::from_str(&manifest).context("decoding rendered volume")?,
                )
                .await?;
        }
    }
    let pvc_name = cluster::env_pvc_name(env_id);
    if store
        .get_persistent_volume_claim(&pvc_name)
        .await?
        .is_none()
    {
        let manifest = substitute(
            &templates.env_pvc,
            &[
                (
                    template::VAR_PV_SIZE,
                    config.provision_volume_size.as_str(),
                ),
                (template::VAR_PVC_NAME, pvc_name.as_str()),
                (
                    template::VAR_PVC_STORAGE_CLASS,
                    config.volume_storage_class.as_str(),
                ),
            ],
        );
        store
            .save_persistent_volume_claim(
                serde_yaml::from_str(&manifest).context("decoding rendered volume claim")?,
            )
            .await?;
    }
    Ok(pvc_name)
}

/// Poll the slot's pods until they are gone.
async fn wait_for_pod_termination(store: &dyn ClusterStore, app_label: &str) -> Result<()> {
    for _ in 0..POD_TERMINATION_POLLS {
        if store.list_pods(app_label).await?.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(POD_TERMINATION_POLL_INTERVAL).await;
    }
    warn!(app_label = %app_label, "pods still terminating; continuing");
    Ok(())
}

/// Compose the client-facing details for a deployed slot.
fn build_details(
    config: &Config,
    env_id: &str,
    claim_token: &str,
    descriptor: Option<&EnvDescriptor>,
    mut tabs: Vec<Tab>,
) -> DeploymentDetails {
    let host = &config.node_host_name;
    let proto = &config.node_host_protocol;
    let log_url = format!("{proto}://{SESSION_ID_PLACEHOLDER}-{DEFAULT_LOG_PORT}.{host}");
    let mut editor_url = format!("{proto}://{SESSION_ID_PLACEHOLDER}-{DEFAULT_EDITOR_PORT}.{host}");
    if let Some(editor) = descriptor.and_then(|d| d.editor.as_ref()) {
        if editor.hide {
            editor_url.clear();
        } else if !editor.src_dir.is_empty() {
            editor_url.push_str("?src=");
            editor_url.push_str(&urlencoding::encode(&editor.src_dir));
        }
    }
    for tab in &mut tabs {
        tab.url = format!(
            "{proto}://{SESSION_ID_PLACEHOLDER}-{DEFAULT_PROXY_PORT}-{}.{host}{}",
            tab.port, tab.path
        );
    }
    DeploymentDetails {
        node_host_name: host.clone(),
        env_id: env_id.to_string(),
        claim_token: claim_token.to_string(),
        log_url,
        editor_url,
        tabs,
    }
}

fn render_env_vars(env_vars: &BTreeMap<String, String>) -> String {
    env_vars
        .iter()
        .map(|(name, value)| {
            format!("          - name: {name}\n            value: \"{value}\"")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
