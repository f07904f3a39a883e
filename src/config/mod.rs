/// Configuration management for gpu-occupy
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::occupy::error::{OccupyError, OccupyResult};

/// Label value stamped on every placeholder job this tool creates
pub const MANAGED_BY: &str = "gpu-occupy";

/// Main occupancy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupyConfig {
    /// Namespace placeholder jobs are submitted to
    pub namespace: String,

    /// Directory holding generated manifests (`<job-name>.yaml`)
    pub yaml_dir: PathBuf,

    /// Kubeconfig path (falls back to kubectl's own resolution)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Upper bound for every kubectl call
    #[serde(default = "default_kubectl_timeout")]
    pub kubectl_timeout_secs: u64,

    /// When a node counts as idle
    #[serde(default)]
    pub idle_policy: IdlePolicy,

    /// Count GPU requests from pods in every namespace, not just `namespace`
    #[serde(default)]
    pub scan_all_namespaces: bool,

    /// Extended resource name for GPUs
    #[serde(default = "default_gpu_resource")]
    pub gpu_resource: String,

    /// Placeholder job settings
    pub job: JobConfig,
}

/// Idleness threshold used to pick occupation candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdlePolicy {
    /// No GPU-requesting pod on the node
    #[default]
    FullyIdle,
    /// At least one unallocated GPU on the node
    AnyFree,
}

/// Placeholder job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Resource kind used for `kubectl delete` and listing (e.g. "pytorchjob")
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Prefix of generated job names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Container image for the placeholder workload
    pub image: String,

    /// Shell command run inside the placeholder container
    #[serde(default = "default_command")]
    pub command: String,

    /// EFA resource name; omit to skip EFA requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efa_resource: Option<String>,

    /// Custom Handlebars template replacing the built-in PyTorchJob manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<PathBuf>,
}

fn default_kubectl_timeout() -> u64 {
    30
}

fn default_gpu_resource() -> String {
    "nvidia.com/gpu".to_string()
}

fn default_kind() -> String {
    "pytorchjob".to_string()
}

fn default_name_prefix() -> String {
    "occupy".to_string()
}

fn default_command() -> String {
    "nvidia-smi && sleep infinity".to_string()
}

impl OccupyConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> OccupyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OccupyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: OccupyConfig = serde_yaml::from_str(&content)
            .map_err(|e| OccupyError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> OccupyResult<()> {
        if self.namespace.is_empty() {
            return Err(OccupyError::Config("namespace cannot be empty".into()));
        }

        if self.yaml_dir.as_os_str().is_empty() {
            return Err(OccupyError::Config("yaml_dir cannot be empty".into()));
        }

        if self.kubectl_timeout_secs == 0 {
            return Err(OccupyError::Config(
                "kubectl_timeout_secs must be positive".into(),
            ));
        }

        if self.job.image.is_empty() {
            return Err(OccupyError::Config("job.image cannot be empty".into()));
        }

        let prefix = &self.job.name_prefix;
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 20
            && prefix.starts_with(|c: char| c.is_ascii_lowercase())
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_prefix {
            return Err(OccupyError::Config(format!(
                "job.name_prefix '{}' must be 1-20 lowercase alphanumerics or '-', starting with a letter",
                prefix
            )));
        }

        Ok(())
    }

    /// Timeout applied to each kubectl call
    pub fn kubectl_timeout(&self) -> Duration {
        Duration::from_secs(self.kubectl_timeout_secs)
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            namespace: "ray-system".to_string(),
            yaml_dir: PathBuf::from("./occupy-jobs"),
            kubeconfig: None,
            kubectl_timeout_secs: default_kubectl_timeout(),
            idle_policy: IdlePolicy::FullyIdle,
            scan_all_namespaces: false,
            gpu_resource: default_gpu_resource(),
            job: JobConfig {
                kind: default_kind(),
                name_prefix: default_name_prefix(),
                image: "nvcr.io/nvidia/pytorch:24.05-py3".to_string(),
                command: default_command(),
                efa_resource: Some("vpc.amazonaws.com/efa".to_string()),
                template_path: None,
            },
        }
    }
}
