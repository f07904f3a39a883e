/// kubectl JSON output models
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::occupy::error::{OccupyError, OccupyResult};

/// Annotation recording which node a placeholder job pins
pub const NODE_ANNOTATION: &str = "gpu-occupy/node";

/// Annotation recording the SKU key a placeholder job was rendered for
pub const SKU_ANNOTATION: &str = "gpu-occupy/sku";

/// Label key used to select managed placeholder jobs
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Generic `kubectl get ... -o json` list envelope
#[derive(Debug, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Object metadata subset
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Raw node object
#[derive(Debug, Deserialize)]
pub struct NodeItem {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

#[derive(Debug, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

/// Raw pod object
#[derive(Debug, Deserialize)]
pub struct PodItem {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub init_containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub resources: ContainerResources,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerResources {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Raw managed job object (only metadata is read)
#[derive(Debug, Deserialize)]
pub struct JobItem {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

/// A cluster node as seen by the inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: BTreeMap<String, String>,
    pub ready: bool,
    pub schedulable: bool,
}

impl NodeInfo {
    /// Instance type label, preferring the GA label over the beta one
    pub fn instance_type(&self) -> Option<&str> {
        self.labels
            .get("node.kubernetes.io/instance-type")
            .or_else(|| self.labels.get("beta.kubernetes.io/instance-type"))
            .map(String::as_str)
    }

    /// Capacity of an extended resource, zero when the node does not expose it
    pub fn resource_capacity(&self, resource: &str) -> OccupyResult<u32> {
        match self.capacity.get(resource) {
            Some(quantity) => parse_count(quantity).ok_or_else(|| {
                OccupyError::ClusterQuery(format!(
                    "node {} has malformed {} capacity '{}'",
                    self.name, resource, quantity
                ))
            }),
            None => Ok(0),
        }
    }
}

impl From<NodeItem> for NodeInfo {
    fn from(item: NodeItem) -> Self {
        let ready = item
            .status
            .conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True");
        Self {
            name: item.metadata.name,
            labels: item.metadata.labels,
            capacity: item.status.capacity,
            ready,
            schedulable: !item.spec.unschedulable,
        }
    }
}

/// A pod with the resource data needed for GPU accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub node: Option<String>,
    pub phase: String,
    pub containers: Vec<ContainerResources>,
    pub init_containers: Vec<ContainerResources>,
}

impl PodInfo {
    /// Pods that still hold node resources
    pub fn is_active(&self) -> bool {
        matches!(self.phase.as_str(), "Pending" | "Running")
    }

    /// Effective request of an extended resource, as the scheduler counts it:
    /// the larger of the summed app containers and the largest init container.
    pub fn resource_request(&self, resource: &str) -> OccupyResult<u32> {
        let mut app_total = 0u32;
        for container in &self.containers {
            app_total = app_total.saturating_add(self.container_request(container, resource)?);
        }

        let mut init_max = 0u32;
        for container in &self.init_containers {
            init_max = init_max.max(self.container_request(container, resource)?);
        }

        Ok(app_total.max(init_max))
    }

    fn container_request(&self, resources: &ContainerResources, resource: &str) -> OccupyResult<u32> {
        // Extended resources default their request to the limit
        let quantity = resources
            .requests
            .get(resource)
            .or_else(|| resources.limits.get(resource));

        match quantity {
            Some(q) => parse_count(q).ok_or_else(|| {
                OccupyError::ClusterQuery(format!(
                    "pod {} has malformed {} request '{}'",
                    self.name, resource, q
                ))
            }),
            None => Ok(0),
        }
    }
}

impl From<PodItem> for PodInfo {
    fn from(item: PodItem) -> Self {
        Self {
            name: item.metadata.name,
            node: item.spec.node_name.filter(|n| !n.is_empty()),
            phase: item.status.phase.unwrap_or_else(|| "Unknown".to_string()),
            containers: item.spec.containers.into_iter().map(|c| c.resources).collect(),
            init_containers: item
                .spec
                .init_containers
                .into_iter()
                .map(|c| c.resources)
                .collect(),
        }
    }
}

/// A managed placeholder job currently present in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveJob {
    pub name: String,
    pub node: Option<String>,
    pub sku: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

impl From<JobItem> for LiveJob {
    fn from(item: JobItem) -> Self {
        let meta = item.metadata;
        Self {
            node: meta.annotations.get(NODE_ANNOTATION).cloned(),
            sku: meta.annotations.get(SKU_ANNOTATION).cloned(),
            created: meta.creation_timestamp,
            name: meta.name,
        }
    }
}

/// Parse a `kubectl get -o json` list, mapping each raw item into a domain type
pub fn parse_list<R, T>(json: &str, what: &str) -> OccupyResult<Vec<T>>
where
    R: serde::de::DeserializeOwned,
    T: From<R>,
{
    let list: ItemList<R> = serde_json::from_str(json)
        .map_err(|e| OccupyError::ClusterQuery(format!("unparseable {} list: {}", what, e)))?;
    Ok(list.items.into_iter().map(T::from).collect())
}

/// Parse an integral device count quantity ("8", "8.0" is rejected)
fn parse_count(quantity: &str) -> Option<u32> {
    quantity.trim().parse::<u32>().ok()
}
