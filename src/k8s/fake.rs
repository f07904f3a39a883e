/// In-memory cluster used by unit tests
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use super::client::ClusterClient;
use super::models::{ContainerResources, LiveJob, NodeInfo, PodInfo, NODE_ANNOTATION, SKU_ANNOTATION};
use crate::occupy::error::{OccupyError, OccupyResult};
use crate::utils::command::CommandOutput;

#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Mutex<Vec<NodeInfo>>,
    pub pods: Mutex<Vec<PodInfo>>,
    pub jobs: Mutex<Vec<LiveJob>>,
    pub reject_apply: Mutex<HashSet<String>>,
    pub reject_delete: Mutex<HashSet<String>>,
    pub fail_queries: Mutex<bool>,
    pub applied: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn with_nodes(nodes: Vec<NodeInfo>) -> Self {
        let cluster = Self::default();
        *cluster.nodes.lock().unwrap() = nodes;
        cluster
    }

    pub fn add_node(&self, node: NodeInfo) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn add_pod(&self, pod: PodInfo) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn remove_job(&self, name: &str) {
        self.jobs.lock().unwrap().retain(|j| j.name != name);
    }

    pub fn live_job_names(&self) -> Vec<String> {
        self.jobs.lock().unwrap().iter().map(|j| j.name.clone()).collect()
    }

    fn check_queries(&self) -> OccupyResult<()> {
        if *self.fail_queries.lock().unwrap() {
            return Err(OccupyError::ClusterQuery("connection refused".into()));
        }
        Ok(())
    }
}

/// A Ready, schedulable node exposing `gpus` GPUs
pub fn gpu_node(name: &str, instance_type: &str, gpus: u32) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        labels: BTreeMap::from([(
            "node.kubernetes.io/instance-type".to_string(),
            instance_type.to_string(),
        )]),
        capacity: BTreeMap::from([("nvidia.com/gpu".to_string(), gpus.to_string())]),
        ready: true,
        schedulable: true,
    }
}

/// A running pod requesting `gpus` GPUs on `node`
pub fn gpu_pod(name: &str, node: &str, gpus: u32) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        node: Some(node.to_string()),
        phase: "Running".to_string(),
        containers: vec![ContainerResources {
            requests: BTreeMap::from([("nvidia.com/gpu".to_string(), gpus.to_string())]),
            limits: BTreeMap::new(),
        }],
        init_containers: vec![],
    }
}

impl ClusterClient for FakeCluster {
    async fn list_nodes(&self) -> OccupyResult<Vec<NodeInfo>> {
        self.check_queries()?;
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_pods(&self, _namespace: Option<&str>) -> OccupyResult<Vec<PodInfo>> {
        self.check_queries()?;
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn apply_manifest(&self, path: &Path) -> Result<CommandOutput> {
        let content = std::fs::read_to_string(path)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
        let meta = &doc["metadata"];
        let name = meta["name"].as_str().unwrap_or_default().to_string();

        if self.reject_apply.lock().unwrap().contains(&name) {
            return Ok(CommandOutput::failed(format!(
                "Error from server: admission webhook denied {}",
                name
            )));
        }

        let annotation = |key: &str| meta["annotations"][key].as_str().map(str::to_string);
        self.jobs.lock().unwrap().push(LiveJob {
            name: name.clone(),
            node: annotation(NODE_ANNOTATION),
            sku: annotation(SKU_ANNOTATION),
            created: None,
        });
        self.applied.lock().unwrap().push(name.clone());
        Ok(CommandOutput::ok(format!("pytorchjob.kubeflow.org/{} created", name)))
    }

    async fn delete_resource(&self, kind: &str, name: &str) -> Result<CommandOutput> {
        if self.reject_delete.lock().unwrap().contains(name) {
            return Ok(CommandOutput::failed(format!(
                "Error from server (Forbidden): {} {} cannot be deleted",
                kind, name
            )));
        }
        self.remove_job(name);
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(CommandOutput::ok(format!("{} \"{}\" deleted", kind, name)))
    }

    async fn list_managed_jobs(&self, _kind: &str) -> OccupyResult<Vec<LiveJob>> {
        self.check_queries()?;
        Ok(self.jobs.lock().unwrap().clone())
    }
}
