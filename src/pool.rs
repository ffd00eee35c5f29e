//! Slot pool and state machine
//!
//! The pool owns the slot array. Slots move Idle → Provisioning → Idle →
//! Claimed → Running → Idle and are recycled by clearing fields, never
//! destroyed. Request handlers promote slots (claim, up); the periodic
//! reconciler is the only writer that demotes Running/Claimed slots on
//! timeout. All Kubernetes and Git-host I/O happens outside the pool lock,
//! and slot state is re-checked by claim token before any post-I/O commit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::{self, ClusterStore};
use crate::config::{Config, WhitelistEntry, DEFAULT_BRANCH};
use crate::deploy::{self, DeployRequest};
use crate::descriptor;
use crate::details::{details_from_string, DeploymentDetails, Tab};
use crate::repo::{RepoCredentials, RepoFetcher};
use crate::template::Templates;

/// Seconds between reconciler passes; the timer is re-armed after each pass.
pub const RECONCILE_INTERVAL_SECONDS: u64 = 15;

/// A Claimed slot with no activity for this long is released.
///
/// This window can race with a deploy that takes longer than it; `up`
/// detects the lost claim after the deploy I/O and tears the environment
/// back down rather than committing it.
pub const CLAIM_EXPIRE_SECONDS: i64 = 30;

/// Inactivity tolerance of a Running slot unless the up request overrides
/// it.
pub const DEFAULT_EXPIRATION_SECONDS: i64 = 60;

/// Unix seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Provisioning,
    Claimed,
    Running,
}

/// One schedulable environment.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: String,
    pub status: SlotStatus,
    pub claim_token: String,
    pub last_activity: i64,
    pub repo: String,
    pub branch: String,
    pub details: Option<DeploymentDetails>,
    pub expiration_seconds: i64,
}

impl Slot {
    fn new(id: String) -> Self {
        Self {
            id,
            status: SlotStatus::Idle,
            claim_token: String::new(),
            last_activity: 0,
            repo: String::new(),
            branch: String::new(),
            details: None,
            expiration_seconds: DEFAULT_EXPIRATION_SECONDS,
        }
    }

    /// Recycle the slot back to Idle.
    fn clear(&mut self) {
        self.status = SlotStatus::Idle;
        self.claim_token.clear();
        self.last_activity = 0;
        self.repo.clear();
        self.branch.clear();
        self.details = None;
        self.expiration_seconds = DEFAULT_EXPIRATION_SECONDS;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub claim_granted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claim_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub claim_granted: bool,
    pub up: bool,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_details: Option<EnvUpResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvUpResponse {
    pub log_url: String,
    pub editor_url: String,
    pub tabs: Vec<Tab>,
}

impl From<&DeploymentDetails> for EnvUpResponse {
    fn from(details: &DeploymentDetails) -> Self {
        Self {
            log_url: details.log_url.clone(),
            editor_url: details.editor_url.clone(),
            tabs: details.tabs.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvInfoResponse {
    pub env: Option<EnvInfoVars>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvInfoVars {
    pub vars: Vec<EnvVarSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVarSchema {
    pub name: String,
    #[serde(rename = "defaultValue")]
    pub default_value: String,
}

/// Body of an up request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpParams {
    #[serde(default)]
    pub claim_token: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Negative (or omitted) falls back to the default expiration.
    #[serde(default = "default_expiration_param")]
    pub expiration_seconds: i64,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

fn default_expiration_param() -> i64 {
    -1
}

/// Body of an info request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Scheduler-level failure, mapped to an HTTP status by the API layer.
#[derive(Debug)]
pub enum PoolError {
    /// Unknown claim token or repo not allowed; nothing was mutated.
    Unauthorized(&'static str),
    /// Kubernetes or Git-host failure; slot state was not committed.
    Downstream(anyhow::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(message) => write!(f, "{message}"),
            Self::Downstream(e) => write!(f, "{e:#}"),
        }
    }
}

impl From<anyhow::Error> for PoolError {
    fn from(e: anyhow::Error) -> Self {
        Self::Downstream(e)
    }
}

/// Owns the slot array and executes all transitions.
pub struct EnvPool {
    slots: Mutex<Vec<Slot>>,
    store: Arc<dyn ClusterStore>,
    fetcher: Arc<dyn RepoFetcher>,
    templates: Templates,
    config: Config,
}

impl EnvPool {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        fetcher: Arc<dyn RepoFetcher>,
        templates: Templates,
        config: Config,
    ) -> Self {
        let slots = (1..=config.provision_count)
            .map(|index| Slot::new(index.to_string()))
            .collect();
        Self {
            slots: Mutex::new(slots),
            store,
            fetcher,
            templates,
            config,
        }
    }

    /// Copy of the slot array, for inspection.
    pub async fn snapshot(&self) -> Vec<Slot> {
        self.slots.lock().await.clone()
    }

    /// Reserve the first idle slot.
    pub async fn claim(&self) -> ClaimResponse {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.iter_mut().find(|s| s.status == SlotStatus::Idle) else {
            info!("claim failed; no environments available");
            return ClaimResponse {
                claim_granted: false,
                claim_token: String::new(),
                message: "No environments available".to_string(),
            };
        };
        let claim_token = Uuid::new_v4().to_string();
        slot.status = SlotStatus::Claimed;
        slot.claim_token = claim_token.clone();
        slot.last_activity = now_secs();
        info!(env_id = %slot.id, "environment claimed");
        ClaimResponse {
            claim_granted: true,
            claim_token,
            message: String::new(),
        }
    }

    /// Refresh a claim and report whether its environment is up.
    ///
    /// With `get_details` the cluster is asked whether the deployment still
    /// exists; a vanished deployment demotes the slot back to Claimed.
    pub async fn ping(
        &self,
        claim_token: &str,
        get_details: bool,
    ) -> Result<PingResponse, PoolError> {
        let snapshot = {
            let mut slots = self.slots.lock().await;
            match find_by_token_mut(&mut slots, claim_token) {
                None => {
                    return Ok(PingResponse {
                        claim_granted: false,
                        up: false,
                        repo: String::new(),
                        branch: String::new(),
                        env_details: None,
                    })
                }
                Some(slot) => {
                    slot.last_activity = now_secs();
                    (
                        slot.id.clone(),
                        slot.status == SlotStatus::Running,
                        slot.repo.clone(),
                        slot.branch.clone(),
                        slot.details.clone(),
                    )
                }
            }
        };
        let (env_id, up, repo, branch, details) = snapshot;
        let mut response = PingResponse {
            claim_granted: true,
            up,
            repo,
            branch,
            env_details: None,
        };
        if up && get_details {
            let deployed = deploy::is_env_deployed(self.store.as_ref(), &env_id).await?;
            if deployed {
                response.env_details = details.as_ref().map(EnvUpResponse::from);
            } else {
                info!(env_id = %env_id, "environment vanished; demoting to claimed");
                response.up = false;
                let mut slots = self.slots.lock().await;
                if let Some(slot) = find_by_token_mut(&mut slots, claim_token) {
                    slot.status = SlotStatus::Claimed;
                    slot.repo.clear();
                    slot.branch.clear();
                    slot.details = None;
                }
            }
        }
        Ok(response)
    }

    /// Bind a claimed slot to a repo and materialise it.
    ///
    /// Returns the cached details when the deployment already exists for
    /// the same repo and branch (case-insensitive).
    pub async fn up(&self, params: UpParams) -> Result<EnvUpResponse, PoolError> {
        let branch = if params.branch.is_empty() {
            DEFAULT_BRANCH.to_string()
        } else {
            params.branch.clone()
        };
        if !self.config.repo_whitelisted(&params.repo, &branch) {
            warn!(repo = %params.repo, "up rejected; repo not whitelisted");
            return Err(PoolError::Unauthorized("Invalid repo"));
        }
        let (env_id, status, bound_repo, bound_branch, details) = {
            let slots = self.slots.lock().await;
            match find_by_token(&slots, &params.claim_token) {
                None => {
                    warn!("up rejected; claim no longer valid");
                    return Err(PoolError::Unauthorized("Invalid claim token"));
                }
                Some(slot) => (
                    slot.id.clone(),
                    slot.status,
                    slot.repo.clone(),
                    slot.branch.clone(),
                    slot.details.clone(),
                ),
            }
        };

        let deployed = deploy::is_env_deployed(self.store.as_ref(), &env_id).await?;
        if deployed
            && status == SlotStatus::Running
            && bound_repo.eq_ignore_ascii_case(&params.repo)
            && bound_branch.eq_ignore_ascii_case(&branch)
        {
            if let Some(details) = &details {
                info!(env_id = %env_id, "returning existing environment details");
                return Ok(EnvUpResponse::from(details));
            }
        }

        // demote to Claimed so the reconciler does not read the teardown of
        // the old repo as an expired environment
        {
            let mut slots = self.slots.lock().await;
            let Some(slot) = find_by_token_mut(&mut slots, &params.claim_token) else {
                return Err(PoolError::Unauthorized("Invalid claim token"));
            };
            slot.status = SlotStatus::Claimed;
            slot.last_activity = now_secs();
        }

        let creds = RepoCredentials::new(&params.username, &params.password);
        let request = DeployRequest {
            env_id: &env_id,
            claim_token: &params.claim_token,
            repo: &params.repo,
            branch: &branch,
            creds: &creds,
            env_vars: &params.env_vars,
        };
        let details = match deploy::deploy_env(
            self.store.as_ref(),
            self.fetcher.as_ref(),
            &self.templates,
            &self.config,
            &request,
        )
        .await
        {
            Ok(details) => details,
            Err(e) => {
                error!(env_id = %env_id, error = %e, "deploy failed");
                return Err(PoolError::Downstream(e));
            }
        };

        // the claim may have expired while the deploy ran; never commit a
        // deployment nobody owns
        let committed = {
            let mut slots = self.slots.lock().await;
            match find_by_token_mut(&mut slots, &params.claim_token) {
                Some(slot) => {
                    slot.status = SlotStatus::Running;
                    slot.repo = params.repo.clone();
                    slot.branch = branch;
                    slot.details = Some(details.clone());
                    slot.last_activity = now_secs();
                    slot.expiration_seconds = if params.expiration_seconds >= 0 {
                        params.expiration_seconds
                    } else {
                        DEFAULT_EXPIRATION_SECONDS
                    };
                    true
                }
                None => false,
            }
        };
        if !committed {
            warn!(env_id = %env_id, "claim expired during deploy; tearing back down");
            if let Err(e) =
                deploy::teardown_env(self.store.as_ref(), &env_id, Some(&params.claim_token)).await
            {
                warn!(env_id = %env_id, error = %e, "teardown after lost claim failed");
            }
            return Err(PoolError::Unauthorized("Invalid claim token"));
        }
        Ok(EnvUpResponse::from(&details))
    }

    /// Report the env-var schema a repo's descriptor declares.
    pub async fn info(&self, params: InfoParams) -> Result<EnvInfoResponse, PoolError> {
        let branch = if params.branch.is_empty() {
            DEFAULT_BRANCH.to_string()
        } else {
            params.branch
        };
        if !self.config.repo_whitelisted(&params.repo, &branch) {
            warn!(repo = %params.repo, "info rejected; repo not whitelisted");
            return Err(PoolError::Unauthorized("Invalid repo"));
        }
        let creds = RepoCredentials::new(&params.username, &params.password);
        let descriptor =
            descriptor::download_descriptor(self.fetcher.as_ref(), &params.repo, &branch, &creds)
                .await?;
        let env = descriptor
            .and_then(|d| d.env)
            .and_then(|e| e.vars)
            .map(|vars| EnvInfoVars {
                vars: vars
                    .into_iter()
                    .map(|v| EnvVarSchema {
                        name: v.name,
                        default_value: v.default_value,
                    })
                    .collect(),
            });
        Ok(EnvInfoResponse { env })
    }

    /// Configured whitelist entries.
    pub fn whitelist(&self) -> Option<Vec<WhitelistEntry>> {
        self.config.whitelist.clone()
    }

    /// Initialise the pool against the cluster: re-hydrate running slots
    /// from deployment annotations, provision the rest, tear down surplus
    /// environments, then run one reconciler pass.
    pub async fn init(&self) -> Result<()> {
        let count = self.config.provision_count;
        info!(count, "initialising environment pool");
        for index in 1..=count {
            let env_id = index.to_string();
            if let Err(e) = self.init_slot(&env_id).await {
                error!(env_id = %env_id, error = %e, "slot initialisation failed");
            }
        }
        self.scale_down(count).await;
        self.reconcile(now_secs()).await;
        Ok(())
    }

    async fn init_slot(&self, env_id: &str) -> Result<()> {
        let deployment = match self
            .store
            .get_deployment(&cluster::env_deployment_name(env_id))
            .await
        {
            Ok(deployment) => deployment,
            Err(e) => {
                warn!(env_id = %env_id, error = %e, "deployment lookup failed; provisioning");
                None
            }
        };
        if let Some(deployment) = deployment {
            if let Some(record) = recovery_record(&deployment) {
                info!(env_id = %env_id, "re-hydrating running environment from metadata");
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.iter_mut().find(|s| s.id == env_id) {
                    slot.status = SlotStatus::Running;
                    slot.claim_token = record.claim_token;
                    slot.repo = record.repo;
                    slot.branch = record.branch;
                    slot.details = Some(record.details);
                    slot.last_activity = now_secs();
                    slot.expiration_seconds = DEFAULT_EXPIRATION_SECONDS;
                }
                return Ok(());
            }
            info!(env_id = %env_id, "insufficient deployment metadata; tearing down");
            deploy::teardown_env(self.store.as_ref(), env_id, None).await?;
        }
        self.set_status(env_id, SlotStatus::Provisioning).await;
        deploy::deploy_provisioner(self.store.as_ref(), &self.templates, &self.config, env_id).await
    }

    /// Tear down environments beyond the configured pool size, as long as
    /// their PVC still exists.
    async fn scale_down(&self, count: usize) {
        let mut index = count + 1;
        loop {
            let env_id = index.to_string();
            let pvc_name = cluster::env_pvc_name(&env_id);
            match self.store.get_persistent_volume_claim(&pvc_name).await {
                Ok(Some(_)) => {
                    info!(env_id = %env_id, "de-provisioning surplus environment");
                    if let Err(e) = deploy::teardown_env(self.store.as_ref(), &env_id, None).await {
                        warn!(env_id = %env_id, error = %e, "surplus teardown failed");
                    }
                    if let Err(e) = deploy::delete_provisioner(self.store.as_ref(), &env_id).await {
                        warn!(env_id = %env_id, error = %e, "surplus provisioner delete failed");
                    }
                    if let Err(e) = self.store.delete_persistent_volume_claim(&pvc_name).await {
                        warn!(env_id = %env_id, error = %e, "surplus volume claim delete failed");
                    }
                    if self.config.host_path_volumes() {
                        if let Err(e) = self
                            .store
                            .delete_persistent_volume(&cluster::env_pv_name(&env_id))
                            .await
                        {
                            warn!(env_id = %env_id, error = %e, "surplus volume delete failed");
                        }
                    }
                    index += 1;
                }
                _ => break,
            }
        }
    }

    /// Run the reconciler forever; the interval re-arms after each pass, so
    /// a long pass delays the next tick rather than coalescing.
    pub async fn run_reconciler(self: Arc<Self>) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(RECONCILE_INTERVAL_SECONDS)).await;
            self.reconcile(now_secs()).await;
        }
    }

    /// One reconciler pass. Per-slot errors are logged; one failing slot
    /// never blocks the others.
    pub async fn reconcile(&self, now: i64) {
        let ids: Vec<String> = self.slots.lock().await.iter().map(|s| s.id.clone()).collect();
        for env_id in ids {
            if let Err(e) = self.reconcile_slot(&env_id, now).await {
                warn!(env_id = %env_id, error = %e, "reconcile error; retrying next pass");
            }
        }
    }

    async fn reconcile_slot(&self, env_id: &str, now: i64) -> Result<()> {
        let snapshot = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.iter_mut().find(|s| s.id == env_id) else {
                return Ok(());
            };
            match slot.status {
                SlotStatus::Idle => return Ok(()),
                SlotStatus::Claimed => {
                    if now - slot.last_activity > CLAIM_EXPIRE_SECONDS {
                        info!(env_id = %env_id, "claim expired");
                        slot.clear();
                    }
                    return Ok(());
                }
                SlotStatus::Provisioning => None,
                SlotStatus::Running => Some((
                    slot.claim_token.clone(),
                    slot.last_activity,
                    slot.expiration_seconds,
                )),
            }
        };
        match snapshot {
            // provisioning: wait for the provisioner to finish
            None => {
                if deploy::is_provisioner_running(self.store.as_ref(), env_id).await? {
                    return Ok(());
                }
                info!(env_id = %env_id, "provisioning complete");
                deploy::delete_provisioner(self.store.as_ref(), env_id).await?;
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots
                    .iter_mut()
                    .find(|s| s.id == env_id && s.status == SlotStatus::Provisioning)
                {
                    slot.status = SlotStatus::Idle;
                }
            }
            // running: expire on inactivity, or notice a vanished deployment
            Some((claim_token, last_activity, expiration_seconds)) => {
                if now - last_activity > expiration_seconds {
                    info!(env_id = %env_id, "environment no longer active; recycling");
                    {
                        let mut slots = self.slots.lock().await;
                        match find_by_token_mut(&mut slots, &claim_token) {
                            Some(slot) if slot.id == env_id => slot.clear(),
                            _ => return Ok(()),
                        }
                    }
                    deploy::teardown_env(self.store.as_ref(), env_id, Some(&claim_token)).await?;
                    deploy::deploy_provisioner(
                        self.store.as_ref(),
                        &self.templates,
                        &self.config,
                        env_id,
                    )
                    .await?;
                    // a claim taken while the teardown ran keeps the slot
                    let mut slots = self.slots.lock().await;
                    if let Some(slot) = slots.iter_mut().find(|s| {
                        s.id == env_id
                            && s.status == SlotStatus::Idle
                            && s.claim_token.is_empty()
                    }) {
                        slot.status = SlotStatus::Provisioning;
                    }
                } else if !deploy::is_env_deployed(self.store.as_ref(), env_id).await? {
                    info!(env_id = %env_id, "environment no longer deployed");
                    let mut slots = self.slots.lock().await;
                    if let Some(slot) = find_by_token_mut(&mut slots, &claim_token) {
                        if slot.id == env_id {
                            slot.clear();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_status(&self, env_id: &str, status: SlotStatus) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.id == env_id) {
            slot.status = status;
        }
    }
}

fn find_by_token<'a>(slots: &'a [Slot], claim_token: &str) -> Option<&'a Slot> {
    if claim_token.is_empty() {
        return None;
    }
    slots.iter().find(|s| s.claim_token == claim_token)
}

fn find_by_token_mut<'a>(slots: &'a mut [Slot], claim_token: &str) -> Option<&'a mut Slot> {
    if claim_token.is_empty() {
        return None;
    }
    slots.iter_mut().find(|s| s.claim_token == claim_token)
}

struct RecoveredSlot {
    claim_token: String,
    repo: String,
    branch: String,
    details: DeploymentDetails,
}

/// Decode the recovery record a deployment carries in its pod-template
/// annotations. `None` when the record is incomplete, unparseable or of an
/// unknown schema version; a missing version annotation counts as the
/// current schema.
fn recovery_record(deployment: &Deployment) -> Option<RecoveredSlot> {
    let schema = cluster::pod_template_annotation(deployment, cluster::ANNOTATION_SCHEMA_VERSION)
        .unwrap_or(cluster::RECOVERY_SCHEMA_VERSION);
    if schema != cluster::RECOVERY_SCHEMA_VERSION {
        warn!(schema = %schema, "unknown recovery schema version");
        return None;
    }
    let repo = cluster::pod_template_annotation(deployment, cluster::ANNOTATION_REPO)?;
    let claim_token = cluster::pod_template_annotation(deployment, cluster::ANNOTATION_CLAIM_TOKEN)?;
    let raw_details = cluster::pod_template_annotation(deployment, cluster::ANNOTATION_ENV_DETAILS)?;
    if repo.is_empty() || claim_token.is_empty() || raw_details.is_empty() {
        return None;
    }
    let details = details_from_string(raw_details)?;
    let branch = cluster::pod_template_annotation(deployment, cluster::ANNOTATION_BRANCH)
        .unwrap_or("")
        .to_string();
    Some(RecoveredSlot {
        claim_token: claim_token.to_string(),
        repo: repo.to_string(),
        branch,
        details,
    })
}
