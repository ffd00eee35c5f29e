//! Kubernetes-backed object store
//!
//! Thin typed wrapper over the kube client. The API target and bearer token
//! come from the `KUBERNETES_*` environment when set, otherwise the client
//! falls back to the standard in-cluster / kubeconfig resolution.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

use super::ClusterStore;
use crate::config::Config;

pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    /// Connect using the configured API target and token file, or the
    /// default client resolution when no explicit target is configured.
    pub async fn from_env(config: &Config) -> Result<Self> {
        let client = if config.kube_host.is_empty() {
            Client::try_default()
                .await
                .context("resolving default Kubernetes client")?
        } else {
            let url = format!(
                "{}://{}:{}",
                config.kube_protocol, config.kube_host, config.kube_port
            );
            let mut kube_config =
                kube::Config::new(url.parse().context("parsing Kubernetes API url")?);
            kube_config.default_namespace = config.namespace.clone();
            if !config.kube_token_path.is_empty() {
                kube_config.auth_info.token_file = Some(config.kube_token_path.clone());
            }
            kube_config.accept_invalid_certs = true;
            Client::try_from(kube_config).context("building Kubernetes client")?
        };
        Ok(Self {
            client,
            namespace: config.namespace.clone(),
        })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn replica_sets(&self) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn persistent_volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn persistent_volume_claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Get an object, mapping 404 to `None`.
async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete an object, tolerating 404.
async fn delete_quiet<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create an object; an existing object with the same name is replaced by
/// delete-then-create.
async fn create_or_replace<K>(api: &Api<K>, manifest: K) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), &manifest).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            let name = manifest.meta().name.clone().unwrap_or_default();
            debug!(name = %name, "object exists, replacing");
            delete_quiet(api, &name).await?;
            api.create(&PostParams::default(), &manifest).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        get_opt(&self.deployments(), name).await
    }

    async fn save_deployment(&self, manifest: Deployment) -> Result<()> {
        create_or_replace(&self.deployments(), manifest).await
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        delete_quiet(&self.deployments(), name).await
    }

    async fn delete_replica_sets(&self, app_label: &str) -> Result<()> {
        let lp = ListParams::default().labels(&format!("app={app_label}"));
        self.replica_sets()
            .delete_collection(&DeleteParams::default(), &lp)
            .await?;
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        get_opt(&self.services(), name).await
    }

    async fn save_service(&self, manifest: Service) -> Result<()> {
        create_or_replace(&self.services(), manifest).await
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        delete_quiet(&self.services(), name).await
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        get_opt(&self.persistent_volumes(), name).await
    }

    async fn save_persistent_volume(&self, manifest: PersistentVolume) -> Result<()> {
        create_or_replace(&self.persistent_volumes(), manifest).await
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        delete_quiet(&self.persistent_volumes(), name).await
    }

    async fn get_persistent_volume_claim(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        get_opt(&self.persistent_volume_claims(), name).await
    }

    async fn save_persistent_volume_claim(&self, manifest: PersistentVolumeClaim) -> Result<()> {
        create_or_replace(&self.persistent_volume_claims(), manifest).await
    }

    async fn delete_persistent_volume_claim(&self, name: &str) -> Result<()> {
        delete_quiet(&self.persistent_volume_claims(), name).await
    }

    async fn save_job(&self, manifest: Job) -> Result<()> {
        create_or_replace(&self.jobs(), manifest).await
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        delete_quiet(&self.jobs(), name).await
    }

    async fn list_pods(&self, app_label: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&format!("app={app_label}"));
        Ok(self.pods().list(&lp).await?.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        delete_quiet(&self.pods(), name).await
    }
}
