/// Kubernetes operations client
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::models::{parse_list, JobItem, LiveJob, NodeInfo, NodeItem, PodInfo, PodItem, MANAGED_BY_LABEL};
use crate::config::{OccupyConfig, MANAGED_BY};
use crate::occupy::error::{OccupyError, OccupyResult};
use crate::utils::command::{CommandBuilder, CommandOutput};

/// The cluster operations the occupancy subsystem depends on.
///
/// Apply and delete report the raw command outcome; a spawn failure or
/// timeout comes back as `Err` and is treated as a per-call failure.
#[allow(async_fn_in_trait)]
pub trait ClusterClient {
    /// All nodes in the cluster
    async fn list_nodes(&self) -> OccupyResult<Vec<NodeInfo>>;

    /// Pods in `namespace`, or in every namespace when `None`
    async fn list_pods(&self, namespace: Option<&str>) -> OccupyResult<Vec<PodInfo>>;

    /// `kubectl apply -f <path>`
    async fn apply_manifest(&self, path: &Path) -> Result<CommandOutput>;

    /// `kubectl delete <kind> <name>`
    async fn delete_resource(&self, kind: &str, name: &str) -> Result<CommandOutput>;

    /// Placeholder jobs of `kind` carrying the managed-by label
    async fn list_managed_jobs(&self, kind: &str) -> OccupyResult<Vec<LiveJob>>;
}

/// Kubernetes client for kubectl operations
pub struct KubernetesClient {
    kubeconfig: Option<PathBuf>,
    namespace: String,
    timeout: Duration,
}

impl KubernetesClient {
    /// Create a client scoped to the configured namespace
    pub fn new(config: &OccupyConfig) -> Self {
        Self {
            kubeconfig: config.kubeconfig.clone(),
            namespace: config.namespace.clone(),
            timeout: config.kubectl_timeout(),
        }
    }

    /// Check if kubectl is installed
    pub async fn check_kubectl_installed() -> Result<()> {
        crate::utils::command::check_tool_installed(
            "kubectl",
            &["version", "--client"],
            "https://kubernetes.io/docs/tasks/tools/",
        )
        .await
    }

    fn kubectl(&self) -> CommandBuilder {
        CommandBuilder::new("kubectl")
            .kubeconfig(self.kubeconfig.as_deref())
            .timeout(self.timeout)
    }

    /// Run a read-only query, folding every failure into `ClusterQuery`
    async fn query(&self, builder: CommandBuilder, what: &str) -> OccupyResult<String> {
        let output = builder
            .context(format!("Failed to list {}", what))
            .output()
            .await
            .map_err(|e| OccupyError::ClusterQuery(format!("{:#}", e)))?;

        if !output.success {
            return Err(OccupyError::ClusterQuery(format!(
                "listing {} failed: {}",
                what,
                output.stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

impl ClusterClient for KubernetesClient {
    async fn list_nodes(&self) -> OccupyResult<Vec<NodeInfo>> {
        let json = self
            .query(self.kubectl().args(["get", "nodes", "-o", "json"]), "nodes")
            .await?;
        parse_list::<NodeItem, _>(&json, "node")
    }

    async fn list_pods(&self, namespace: Option<&str>) -> OccupyResult<Vec<PodInfo>> {
        let builder = self.kubectl().args(["get", "pods", "-o", "json"]);
        let builder = match namespace {
            Some(ns) => builder.namespace(ns),
            None => builder.arg("--all-namespaces"),
        };
        let json = self.query(builder, "pods").await?;
        parse_list::<PodItem, _>(&json, "pod")
    }

    async fn apply_manifest(&self, path: &Path) -> Result<CommandOutput> {
        self.kubectl()
            .args(["apply", "-f"])
            .arg(path)
            .namespace(&self.namespace)
            .context(format!("Failed to apply {}", path.display()))
            .output()
            .await
    }

    async fn delete_resource(&self, kind: &str, name: &str) -> Result<CommandOutput> {
        self.kubectl()
            .args(["delete", kind, name, "--ignore-not-found=true"])
            .namespace(&self.namespace)
            .context(format!("Failed to delete {} {}", kind, name))
            .output()
            .await
    }

    async fn list_managed_jobs(&self, kind: &str) -> OccupyResult<Vec<LiveJob>> {
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY);
        let builder = self
            .kubectl()
            .args(["get", kind, "-l", selector.as_str(), "-o", "json"])
            .namespace(&self.namespace);
        let json = self.query(builder, kind).await?;
        parse_list::<JobItem, _>(&json, kind)
    }
}
