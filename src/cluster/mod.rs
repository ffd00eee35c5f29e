//! Kubernetes object store
//!
//! The control plane treats the cluster as an opaque store of typed objects.
//! Everything goes through [`ClusterStore`] so tests can substitute an
//! in-memory implementation for the real API server.

mod names;
mod store;

pub use names::{
    env_app_label, env_deployment_name, env_pv_name, env_pv_path, env_pvc_name, env_service_name,
    provisioner_app_label, provisioner_job_name,
};
pub use store::KubeStore;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};

/// Typed get/save/delete over the Kubernetes API.
///
/// Deletes are quiet: deleting an object that does not exist is not an
/// error. `get_*` returns `None` for a missing object and `Err` only for
/// transport failures.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>>;
    async fn save_deployment(&self, manifest: Deployment) -> Result<()>;
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    /// Delete all replica sets carrying the given app label.
    async fn delete_replica_sets(&self, app_label: &str) -> Result<()>;

    async fn get_service(&self, name: &str) -> Result<Option<Service>>;
    async fn save_service(&self, manifest: Service) -> Result<()>;
    async fn delete_service(&self, name: &str) -> Result<()>;

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;
    async fn save_persistent_volume(&self, manifest: PersistentVolume) -> Result<()>;
    async fn delete_persistent_volume(&self, name: &str) -> Result<()>;

    async fn get_persistent_volume_claim(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;
    async fn save_persistent_volume_claim(&self, manifest: PersistentVolumeClaim) -> Result<()>;
    async fn delete_persistent_volume_claim(&self, name: &str) -> Result<()>;

    async fn save_job(&self, manifest: Job) -> Result<()>;
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// List pods carrying the given app label.
    async fn list_pods(&self, app_label: &str) -> Result<Vec<Pod>>;
    async fn delete_pod(&self, name: &str) -> Result<()>;
}

/// Pod-template annotation keys forming the slot recovery record.
pub const ANNOTATION_REPO: &str = "repo";
pub const ANNOTATION_BRANCH: &str = "branch";
pub const ANNOTATION_CLAIM_TOKEN: &str = "claimToken";
pub const ANNOTATION_ENV_DETAILS: &str = "envDetails";
pub const ANNOTATION_SCHEMA_VERSION: &str = "schemaVersion";

/// The recovery record schema written by the current deployment templates.
pub const RECOVERY_SCHEMA_VERSION: &str = "1";

/// Read a pod-template annotation off a deployment.
pub fn pod_template_annotation<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}
