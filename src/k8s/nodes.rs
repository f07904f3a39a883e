/// GPU node inventory
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::client::ClusterClient;
use crate::config::{IdlePolicy, OccupyConfig};
use crate::occupy::error::OccupyResult;

/// Snapshot of a GPU-capable node and its GPU accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuNode {
    pub name: String,
    pub instance_type: String,
    pub gpu_capacity: u32,
    pub gpu_allocated: u32,
    pub ready: bool,
    pub schedulable: bool,
}

impl GpuNode {
    pub fn gpu_free(&self) -> u32 {
        self.gpu_capacity.saturating_sub(self.gpu_allocated)
    }

    pub fn is_idle(&self, policy: IdlePolicy) -> bool {
        match policy {
            IdlePolicy::FullyIdle => self.gpu_allocated == 0,
            IdlePolicy::AnyFree => self.gpu_free() > 0,
        }
    }
}

/// Per-instance-type counts for the operator overview
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeSummary {
    pub total_nodes: usize,
    pub idle_nodes: usize,
    pub idle_gpus: u32,
}

/// Queries node and pod state and derives free GPU capacity per node
pub struct NodeInventory<'a, C> {
    cluster: &'a C,
    gpu_resource: String,
    pod_namespace: Option<String>,
    idle_policy: IdlePolicy,
}

impl<'a, C: ClusterClient> NodeInventory<'a, C> {
    /// Create an inventory bound to a cluster
    pub fn new(cluster: &'a C, config: &OccupyConfig) -> Self {
        let pod_namespace = if config.scan_all_namespaces {
            None
        } else {
            Some(config.namespace.clone())
        };
        Self {
            cluster,
            gpu_resource: config.gpu_resource.clone(),
            pod_namespace,
            idle_policy: config.idle_policy,
        }
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        self.idle_policy
    }

    /// All nodes exposing GPUs, sorted by instance type then name
    pub async fn list_gpu_nodes(&self) -> OccupyResult<Vec<GpuNode>> {
        let (nodes, pods) = futures::try_join!(
            self.cluster.list_nodes(),
            self.cluster.list_pods(self.pod_namespace.as_deref())
        )?;

        let mut allocated: BTreeMap<String, u32> = BTreeMap::new();
        for pod in pods.iter().filter(|p| p.is_active()) {
            let Some(node) = &pod.node else {
                continue;
            };
            let request = pod.resource_request(&self.gpu_resource)?;
            if request > 0 {
                debug!("Pod {} requests {} GPUs on {}", pod.name, request, node);
                *allocated.entry(node.clone()).or_default() += request;
            }
        }

        let mut gpu_nodes = Vec::new();
        for node in nodes {
            let capacity = node.resource_capacity(&self.gpu_resource)?;
            if capacity == 0 {
                continue;
            }
            gpu_nodes.push(GpuNode {
                instance_type: node.instance_type().unwrap_or("unknown").to_string(),
                gpu_capacity: capacity,
                gpu_allocated: allocated.get(&node.name).copied().unwrap_or(0),
                ready: node.ready,
                schedulable: node.schedulable,
                name: node.name,
            });
        }

        gpu_nodes.sort_by(|a, b| {
            (a.instance_type.as_str(), a.name.as_str()).cmp(&(b.instance_type.as_str(), b.name.as_str()))
        });
        Ok(gpu_nodes)
    }

    /// Nodes eligible for occupation this cycle
    ///
    /// `occupied` holds the names of nodes already targeted by a tracked job;
    /// those are skipped even when they look idle.
    pub async fn list_idle_gpu_nodes(&self, occupied: &HashSet<String>) -> OccupyResult<Vec<GpuNode>> {
        let nodes = self.list_gpu_nodes().await?;
        Ok(self.idle_candidates(nodes, occupied))
    }

    /// Filter an inventory snapshot down to occupation candidates
    pub fn idle_candidates(&self, nodes: Vec<GpuNode>, occupied: &HashSet<String>) -> Vec<GpuNode> {
        nodes
            .into_iter()
            .filter(|node| {
                if occupied.contains(&node.name) {
                    debug!("Skipping {}: already occupied", node.name);
                    return false;
                }
                if !node.ready || !node.schedulable {
                    warn!("Skipping {}: node is not Ready or is cordoned", node.name);
                    return false;
                }
                node.is_idle(self.idle_policy)
            })
            .collect()
    }
}

/// Summarize an inventory snapshot by instance type
pub fn summarize(nodes: &[GpuNode], idle: &[GpuNode]) -> BTreeMap<String, TypeSummary> {
    let mut summary: BTreeMap<String, TypeSummary> = BTreeMap::new();
    for node in nodes {
        summary.entry(node.instance_type.clone()).or_default().total_nodes += 1;
    }
    for node in idle {
        let entry = summary.entry(node.instance_type.clone()).or_default();
        entry.idle_nodes += 1;
        entry.idle_gpus += node.gpu_free();
    }
    summary
}
