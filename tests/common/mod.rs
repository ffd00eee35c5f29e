//! Common test utilities
#![allow(dead_code)] // not every test file uses every helper

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, Pod, PodStatus, Service,
};
use kube::api::ObjectMeta;

use envpool::cluster::ClusterStore;
use envpool::config::Config;
use envpool::pool::{EnvPool, UpParams};
use envpool::repo::{RepoCredentials, RepoFetcher};
use envpool::template::Templates;

/// In-memory stand-in for the cluster, with save/delete counters so tests
/// can observe what the pipeline actually did.
#[derive(Default)]
pub struct MockStore {
    pub state: Mutex<MockState>,
}

#[derive(Default)]
pub struct MockState {
    pub deployments: HashMap<String, Deployment>,
    pub services: HashMap<String, Service>,
    pub volumes: HashMap<String, PersistentVolume>,
    pub volume_claims: HashMap<String, PersistentVolumeClaim>,
    pub jobs: HashMap<String, Job>,
    pub pods: Vec<Pod>,
    pub deployment_saves: usize,
    pub service_saves: usize,
    pub deleted_deployments: Vec<String>,
    pub deleted_services: Vec<String>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a pod carrying an app label and phase, the way a job or
    /// deployment would create one.
    pub fn add_pod(&self, name: &str, app_label: &str, phase: &str) {
        self.state.lock().unwrap().pods.push(make_pod(name, app_label, phase));
    }

    /// Flip every pod with the label into the given phase.
    pub fn set_pod_phase(&self, app_label: &str, phase: &str) {
        let mut state = self.state.lock().unwrap();
        for pod in state.pods.iter_mut().filter(|p| pod_label(p) == Some(app_label)) {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
        }
    }
}

fn make_pod(name: &str, app_label: &str, phase: &str) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app_label.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_label(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get("app")
        .map(String::as_str)
}

fn object_name<T: kube::Resource>(object: &T) -> String {
    object.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterStore for MockStore {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        Ok(self.state.lock().unwrap().deployments.get(name).cloned())
    }

    async fn save_deployment(&self, manifest: Deployment) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deployment_saves += 1;
        state.deployments.insert(object_name(&manifest), manifest);
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.deployments.remove(name).is_some() {
            state.deleted_deployments.push(name.to_string());
        }
        Ok(())
    }

    async fn delete_replica_sets(&self, _app_label: &str) -> Result<()> {
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.state.lock().unwrap().services.get(name).cloned())
    }

    async fn save_service(&self, manifest: Service) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.service_saves += 1;
        state.services.insert(object_name(&manifest), manifest);
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.services.remove(name).is_some() {
            state.deleted_services.push(name.to_string());
        }
        Ok(())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.state.lock().unwrap().volumes.get(name).cloned())
    }

    async fn save_persistent_volume(&self, manifest: PersistentVolume) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(object_name(&manifest), manifest);
        Ok(())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volumes.remove(name);
        Ok(())
    }

    async fn get_persistent_volume_claim(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state.lock().unwrap().volume_claims.get(name).cloned())
    }

    async fn save_persistent_volume_claim(&self, manifest: PersistentVolumeClaim) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.volume_claims.insert(object_name(&manifest), manifest);
        Ok(())
    }

    async fn delete_persistent_volume_claim(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volume_claims.remove(name);
        Ok(())
    }

    async fn save_job(&self, manifest: Job) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // mirror the cluster: a job immediately spawns a running pod
        // carrying the template's app label
        let job_name = object_name(&manifest);
        let app_label = manifest
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref())
            .and_then(|l| l.get("app"))
            .cloned()
            .unwrap_or_default();
        state
            .pods
            .push(make_pod(&format!("{job_name}-pod"), &app_label, "Running"));
        state.jobs.insert(job_name, manifest);
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().jobs.remove(name);
        Ok(())
    }

    async fn list_pods(&self, app_label: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| pod_label(p) == Some(app_label))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .pods
            .retain(|p| p.metadata.name.as_deref() != Some(name));
        Ok(())
    }
}

/// Map-backed repo fetcher: path → file body.
#[derive(Default)]
pub struct MockFetcher {
    pub files: HashMap<String, String>,
}

impl MockFetcher {
    pub fn with_files(files: &[(&str, &str)]) -> Arc<Self> {
        let mut fetcher = Self::default();
        for (path, body) in files {
            fetcher.files.insert((*path).to_string(), (*body).to_string());
        }
        Arc::new(fetcher)
    }
}

#[async_trait]
impl RepoFetcher for MockFetcher {
    async fn fetch(
        &self,
        _repo: &str,
        _branch: &str,
        path: &str,
        _creds: &RepoCredentials,
    ) -> Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }
}

pub const COMPOSE_TWO_PORTS: &str = r#"
version: "2"
services:
  web:
    image: nginx
    ports:
      - "8080:80"
      - "9000:90"
"#;

pub const DESCRIPTOR_APP_TAB: &str =
    r#"{"proxy":{"ports":[{"port":8080,"name":"app","path":"/"}]}}"#;

const PV_TEMPLATE: &str = r#"
apiVersion: v1
kind: PersistentVolume
metadata:
  name: $pvName
spec:
  capacity:
    storage: $pvSize
  accessModes:
    - ReadWriteOnce
  hostPath:
    path: $pvPath
"#;

const PVC_TEMPLATE: &str = r#"
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: $pvcName
spec:
  accessModes:
    - ReadWriteOnce
  resources:
    requests:
      storage: $pvSize
"#;

const SERVICE_TEMPLATE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: $serviceName
  labels:
    app: $appLabel
spec:
  selector:
    app: $appLabel
  ports:
    - name: log
      port: $logPort
    - name: editor
      port: $editorPort
    - name: proxy
      port: $proxyPort
"#;

const DEPLOYMENT_TEMPLATE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: $deploymentName
  labels:
    app: $appLabel
spec:
  replicas: 1
  selector:
    matchLabels:
      app: $appLabel
  template:
    metadata:
      labels:
        app: $appLabel
      annotations:
        repo: "$gitRepo"
        branch: "$gitBranch"
        claimToken: "$claimToken"
        envDetails: "$envDetails"
        schemaVersion: "1"
    spec:
      containers:
        - name: minienv
          image: minienv/minienv:$minienvVersion
          env:
          - name: MINIENV_GIT_REPO_WITH_CREDS
            value: "$gitRepoWithCreds"
          - name: MINIENV_GIT_REPO
            value: "$gitRepo"
          - name: MINIENV_PLATFORM_PORT
            value: "$minienvPlatformPort"
          - name: MINIENV_PLATFORM
            value: "$minienvPlatform"
          - name: MINIENV_STORAGE_DRIVER
            value: "$storageDriver"
          - name: MINIENV_ALLOW_ORIGIN
            value: "$allowOrigin"
          - name: MINIENV_NODE_NAME_OVERRIDE
            value: "$minienvNodeNameOverride"
          - name: MINIENV_NODE_HOST_PROTOCOL
            value: "$minienvNodeHostProtocol"
$envVars
"#;

const JOB_TEMPLATE: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: $jobName
spec:
  template:
    metadata:
      labels:
        app: $appLabel
    spec:
      restartPolicy: Never
      containers:
        - name: provisioner
          image: minienv/provisioner:$minienvVersion
          env:
          - name: MINIENV_PROVISION_IMAGES
            value: "$provisionImages"
          - name: MINIENV_STORAGE_DRIVER
            value: "$storageDriver"
"#;

pub fn test_templates() -> Templates {
    Templates {
        env_pv: Some(PV_TEMPLATE.to_string()),
        env_pvc: PVC_TEMPLATE.to_string(),
        env_deployment: DEPLOYMENT_TEMPLATE.to_string(),
        env_service: SERVICE_TEMPLATE.to_string(),
        provisioner_job: JOB_TEMPLATE.to_string(),
    }
}

pub fn test_config(provision_count: usize) -> Config {
    Config {
        provision_count,
        node_host_name: "envs.example.com".to_string(),
        node_host_protocol: "https".to_string(),
        provision_volume_size: "10Gi".to_string(),
        ..Default::default()
    }
}

pub fn build_pool(
    provision_count: usize,
    store: Arc<MockStore>,
    fetcher: Arc<MockFetcher>,
) -> EnvPool {
    EnvPool::new(store, fetcher, test_templates(), test_config(provision_count))
}

pub fn up_params(claim_token: &str, repo: &str) -> UpParams {
    UpParams {
        claim_token: claim_token.to_string(),
        repo: repo.to_string(),
        branch: String::new(),
        username: String::new(),
        password: String::new(),
        expiration_seconds: -1,
        env_vars: BTreeMap::new(),
    }
}

/// A deployment named like a slot's, carrying pod-template annotations.
pub fn deployment_with_annotations(
    name: &str,
    annotations: &[(&str, &str)],
) -> Deployment {
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    let annotations: BTreeMap<String, String> = annotations
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
