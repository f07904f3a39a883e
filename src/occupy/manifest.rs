/// Placeholder job manifest rendering
use std::path::PathBuf;

use handlebars::{handlebars_helper, no_escape, Handlebars};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::{OccupyError, OccupyResult};
use super::sku::SkuProfile;
use crate::config::{OccupyConfig, MANAGED_BY};
use crate::k8s::GpuNode;

const TEMPLATE_NAME: &str = "occupy-job";

/// Kubernetes object names are DNS-1123 labels.
const MAX_NAME_LEN: usize = 63;

/// Built-in PyTorchJob manifest. One master replica pinned to a single node.
const DEFAULT_TEMPLATE: &str = r#"apiVersion: kubeflow.org/v1
kind: PyTorchJob
metadata:
  name: {{name}}
  namespace: {{namespace}}
  labels:
    app.kubernetes.io/managed-by: {{managed_by}}
    gpu-occupy/sku: {{sku}}
  annotations:
    gpu-occupy/node: {{quote node}}
    gpu-occupy/sku: {{sku}}
    gpu-occupy/instance-type: {{quote instance_type}}
spec:
  nprocPerNode: "{{gpus}}"
  pytorchReplicaSpecs:
    Master:
      replicas: 1
      restartPolicy: OnFailure
      template:
        metadata:
          labels:
            app.kubernetes.io/managed-by: {{managed_by}}
        spec:
          nodeSelector:
            kubernetes.io/hostname: {{quote node}}
          containers:
            - name: pytorch
              image: {{quote image}}
              command: ["bash", "-c"]
              args:
                - {{quote command}}
              env:
                - name: OCCUPY_NODE
                  value: {{quote node}}
                - name: OCCUPY_GPU_CLASS
                  value: {{quote gpu_class}}
              resources:
                requests:
                  {{gpu_resource}}: {{gpus}}
{{#if efa_resource}}
                  {{efa_resource}}: {{efa}}
{{/if}}
                limits:
                  {{gpu_resource}}: {{gpus}}
{{#if efa_resource}}
                  {{efa_resource}}: {{efa}}
{{/if}}
"#;

// Emit a value as a double-quoted YAML scalar
handlebars_helper!(quote: |v: str| serde_json::to_string(v).unwrap_or_default());

/// A rendered manifest, not yet written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedManifest {
    pub name: String,
    pub node: String,
    pub sku: SkuProfile,
    pub gpus: u32,
    pub content: String,
}

#[derive(Serialize)]
struct TemplateData<'a> {
    name: &'a str,
    namespace: &'a str,
    managed_by: &'a str,
    node: &'a str,
    instance_type: &'a str,
    sku: &'a str,
    gpu_class: &'a str,
    gpu_resource: &'a str,
    gpus: u32,
    efa_resource: Option<&'a str>,
    efa: u32,
    image: &'a str,
    command: &'a str,
}

/// Renders one placeholder job manifest per idle node
pub struct ManifestGenerator {
    registry: Handlebars<'static>,
    namespace: String,
    yaml_dir: PathBuf,
    name_prefix: String,
    gpu_resource: String,
    efa_resource: Option<String>,
    image: String,
    command: String,
}

impl ManifestGenerator {
    /// Compile the configured template; a bad template is fatal
    pub fn new(config: &OccupyConfig) -> OccupyResult<Self> {
        let template = match &config.job.template_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                OccupyError::Template(format!("cannot read {}: {}", path.display(), e))
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };

        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(no_escape);
        registry.register_helper("quote", Box::new(quote));
        registry
            .register_template_string(TEMPLATE_NAME, template)
            .map_err(|e| OccupyError::Template(e.to_string()))?;

        Ok(Self {
            registry,
            namespace: config.namespace.clone(),
            yaml_dir: config.yaml_dir.clone(),
            name_prefix: config.job.name_prefix.clone(),
            gpu_resource: config.gpu_resource.clone(),
            efa_resource: config.job.efa_resource.clone(),
            image: config.job.image.clone(),
            command: config.job.command.clone(),
        })
    }

    /// Deterministic job name: `<prefix>-<node-slug>-<hash8>`
    pub fn job_name(&self, node: &str, sku: SkuProfile) -> String {
        let digest = Sha256::digest(format!("{}|{}", node, sku.key()).as_bytes());
        let suffix = &hex::encode(digest)[..8];

        let budget = MAX_NAME_LEN.saturating_sub(self.name_prefix.len() + suffix.len() + 2);
        let slug = slugify(node, budget);

        format!("{}-{}-{}", self.name_prefix, slug, suffix)
    }

    /// Path a job's manifest lives at
    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.yaml_dir.join(format!("{}.yaml", name))
    }

    /// Render the manifest claiming every free GPU on `node`
    pub fn render(&self, node: &GpuNode, sku: SkuProfile) -> OccupyResult<RenderedManifest> {
        let name = self.job_name(&node.name, sku);
        let gpus = node.gpu_free();

        let data = TemplateData {
            name: &name,
            namespace: &self.namespace,
            managed_by: MANAGED_BY,
            node: &node.name,
            instance_type: &node.instance_type,
            sku: sku.key(),
            gpu_class: sku.gpu_class(),
            gpu_resource: &self.gpu_resource,
            gpus,
            efa_resource: self.efa_resource.as_deref(),
            efa: sku.efa_interfaces(),
            image: &self.image,
            command: &self.command,
        };

        let content = self
            .registry
            .render(TEMPLATE_NAME, &data)
            .map_err(|e| OccupyError::Template(e.to_string()))?;

        let doc: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|e| OccupyError::Template(format!("rendered manifest is not YAML: {}", e)))?;
        if doc["metadata"]["name"].as_str() != Some(name.as_str()) {
            return Err(OccupyError::Template(format!(
                "rendered metadata.name does not match job name {}",
                name
            )));
        }

        debug!("Rendered {} for {} ({} GPUs)", name, node.name, gpus);

        Ok(RenderedManifest {
            name,
            node: node.name.clone(),
            sku,
            gpus,
            content,
        })
    }

    /// Write a rendered manifest to `<yaml_dir>/<name>.yaml`
    pub async fn write(&self, manifest: &RenderedManifest) -> OccupyResult<PathBuf> {
        let path = self.manifest_path(&manifest.name);

        tokio::fs::create_dir_all(&self.yaml_dir)
            .await
            .map_err(|source| OccupyError::ManifestWrite {
                path: self.yaml_dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, &manifest.content)
            .await
            .map_err(|source| OccupyError::ManifestWrite {
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }
}

/// Lowercase DNS-1123 slug of at most `max_len` characters
fn slugify(raw: &str, max_len: usize) -> String {
    let mapped: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let truncated: String = mapped.trim_matches('-').chars().take(max_len).collect();
    let slug = truncated.trim_end_matches('-');

    if slug.is_empty() {
        "node".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> GpuNode {
        GpuNode {
            name: name.to_string(),
            instance_type: "ml.p5.48xlarge".to_string(),
            gpu_capacity: 8,
            gpu_allocated: 0,
            ready: true,
            schedulable: true,
        }
    }

    fn generator() -> ManifestGenerator {
        ManifestGenerator::new(&OccupyConfig::example()).unwrap()
    }

    #[test]
    fn test_job_name_is_deterministic() {
        let generator = generator();
        let first = generator.job_name("gpu-a", SkuProfile::P5);
        assert_eq!(first, generator.job_name("gpu-a", SkuProfile::P5));
        assert!(first.starts_with("occupy-gpu-a-"));
        assert_ne!(first, generator.job_name("gpu-b", SkuProfile::P5));
        assert_ne!(first, generator.job_name("gpu-a", SkuProfile::P4d));
    }

    #[test]
    fn test_job_name_fits_dns_label() {
        let generator = generator();
        let long = format!("hyperpod-i-{}.ec2.internal", "0abc".repeat(20));
        let name = generator.job_name(&long, SkuProfile::P5en);

        assert!(name.len() <= MAX_NAME_LEN);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!name.contains("--"));
    }

    #[test]
    fn test_render_pins_node_and_claims_all_gpus() {
        let generator = generator();
        let manifest = generator.render(&node("gpu-a"), SkuProfile::P5).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&manifest.content).unwrap();

        let pod_spec = &doc["spec"]["pytorchReplicaSpecs"]["Master"]["template"]["spec"];
        assert_eq!(
            pod_spec["nodeSelector"]["kubernetes.io/hostname"].as_str(),
            Some("gpu-a")
        );

        let resources = &pod_spec["containers"][0]["resources"];
        assert_eq!(resources["requests"]["nvidia.com/gpu"].as_u64(), Some(8));
        assert_eq!(resources["limits"]["nvidia.com/gpu"].as_u64(), Some(8));
        assert_eq!(resources["requests"]["vpc.amazonaws.com/efa"].as_u64(), Some(32));

        assert_eq!(doc["metadata"]["name"].as_str(), Some(manifest.name.as_str()));
        assert_eq!(doc["metadata"]["namespace"].as_str(), Some("ray-system"));
        assert_eq!(doc["metadata"]["annotations"]["gpu-occupy/node"].as_str(), Some("gpu-a"));
        assert_eq!(
            doc["metadata"]["labels"]["app.kubernetes.io/managed-by"].as_str(),
            Some(MANAGED_BY)
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let generator = generator();
        let a = generator.render(&node("gpu-a"), SkuProfile::P5).unwrap();
        let b = generator.render(&node("gpu-a"), SkuProfile::P5).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_without_efa() {
        let mut config = OccupyConfig::example();
        config.job.efa_resource = None;
        config.job.command = "echo \"hold\" && sleep 365d".to_string();
        let generator = ManifestGenerator::new(&config).unwrap();

        let manifest = generator.render(&node("gpu-a"), SkuProfile::G5).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&manifest.content).unwrap();
        let container = &doc["spec"]["pytorchReplicaSpecs"]["Master"]["template"]["spec"]["containers"][0];

        assert!(container["resources"]["requests"]["vpc.amazonaws.com/efa"].is_null());
        assert_eq!(container["args"][0].as_str(), Some("echo \"hold\" && sleep 365d"));
    }

    #[test]
    fn test_custom_template_with_unknown_variable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.hbs");
        std::fs::write(&path, "metadata:\n  name: {{name}}\n  owner: {{team}}\n").unwrap();

        let mut config = OccupyConfig::example();
        config.job.template_path = Some(path);
        let generator = ManifestGenerator::new(&config).unwrap();

        let err = generator.render(&node("gpu-a"), SkuProfile::P5).unwrap_err();
        assert!(matches!(err, OccupyError::Template(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_template_file_is_fatal() {
        let mut config = OccupyConfig::example();
        config.job.template_path = Some(PathBuf::from("/nonexistent/job.hbs"));
        assert!(matches!(
            ManifestGenerator::new(&config),
            Err(OccupyError::Template(_))
        ));
    }

    #[tokio::test]
    async fn test_write_uses_job_name_as_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OccupyConfig::example();
        config.yaml_dir = dir.path().join("occupy-jobs");
        let generator = ManifestGenerator::new(&config).unwrap();

        let manifest = generator.render(&node("gpu-a"), SkuProfile::P5).unwrap();
        let path = generator.write(&manifest).await.unwrap();

        assert_eq!(path, config.yaml_dir.join(format!("{}.yaml", manifest.name)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), manifest.content);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Node_01.ec2", 63), "node-01-ec2");
        assert_eq!(slugify("abcdef-", 5), "abcde");
        assert_eq!(slugify("abcd-ef", 5), "abcd");
        assert_eq!(slugify("___", 10), "node");
    }
}
