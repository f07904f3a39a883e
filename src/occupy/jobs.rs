/// Occupancy job tracking
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

use super::error::{OccupyError, OccupyResult};
use super::manifest::{ManifestGenerator, RenderedManifest};
use super::sku::SkuProfile;
use crate::config::OccupyConfig;
use crate::k8s::models::{LiveJob, NODE_ANNOTATION};
use crate::k8s::{ClusterClient, GpuNode};

/// A placeholder job this process knows to be live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyJob {
    pub name: String,
    pub node: String,
    pub sku: Option<SkuProfile>,
    pub manifest_path: PathBuf,
    pub created: DateTime<Utc>,
    pub message: String,
}

/// Which tracked jobs a delete applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelector {
    All,
    Pattern(String),
}

impl DeleteSelector {
    /// `.*` is the select-all shortcut; anything else is a name regex
    pub fn parse(input: &str) -> Self {
        match input.trim() {
            ".*" => DeleteSelector::All,
            pattern => DeleteSelector::Pattern(pattern.to_string()),
        }
    }

    fn compile(&self) -> OccupyResult<Option<Regex>> {
        match self {
            DeleteSelector::All => Ok(None),
            DeleteSelector::Pattern(pattern) => Regex::new(&format!("^(?:{})$", pattern))
                .map(Some)
                .map_err(|source| OccupyError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                }),
        }
    }
}

/// Per-job result of a delete: both halves are always attempted
#[derive(Debug)]
pub struct DeletionReport {
    pub name: String,
    pub node: String,
    pub cluster: OccupyResult<String>,
    pub manifest: OccupyResult<String>,
}

impl DeletionReport {
    pub fn is_ok(&self) -> bool {
        self.cluster.is_ok() && self.manifest.is_ok()
    }
}

/// Submits, tracks and deletes placeholder jobs
///
/// Tracked state is never trusted across runs. It is rebuilt from the
/// managed jobs present in the cluster joined with the manifest directory.
pub struct JobManager<'a, C> {
    cluster: &'a C,
    generator: ManifestGenerator,
    kind: String,
    tracked: BTreeMap<String, OccupancyJob>,
}

impl<'a, C: ClusterClient> JobManager<'a, C> {
    /// Create a manager with empty tracked state; call `recover` next
    pub fn new(cluster: &'a C, config: &OccupyConfig) -> OccupyResult<Self> {
        Ok(Self {
            cluster,
            generator: ManifestGenerator::new(config)?,
            kind: config.job.kind.clone(),
            tracked: BTreeMap::new(),
        })
    }

    #[cfg(test)]
    pub fn generator(&self) -> &ManifestGenerator {
        &self.generator
    }

    /// Rebuild tracked state from scratch
    pub async fn recover(&mut self) -> OccupyResult<usize> {
        self.tracked.clear();
        self.reconcile().await?;
        info!("Recovered {} tracked occupancy jobs", self.tracked.len());
        Ok(self.tracked.len())
    }

    /// Align tracked state with the managed jobs live in the cluster
    ///
    /// Jobs that disappeared are untracked and their manifests removed;
    /// live jobs not yet tracked are adopted. Returns the dropped jobs.
    pub async fn reconcile(&mut self) -> OccupyResult<Vec<OccupancyJob>> {
        let live = self.cluster.list_managed_jobs(&self.kind).await?;
        let live_names: HashSet<&str> = live.iter().map(|j| j.name.as_str()).collect();

        let gone: Vec<String> = self
            .tracked
            .keys()
            .filter(|name| !live_names.contains(name.as_str()))
            .cloned()
            .collect();

        let mut dropped = Vec::new();
        for name in gone {
            if let Some(job) = self.tracked.remove(&name) {
                info!("{} on {} no longer exists in the cluster", job.name, job.node);
                if let Err(e) = remove_manifest(&job.name, &job.manifest_path).await {
                    warn!("{}", e);
                }
                dropped.push(job);
            }
        }

        for job in live {
            if !self.tracked.contains_key(&job.name) {
                if let Some(adopted) = self.adopt(job).await {
                    self.tracked.insert(adopted.name.clone(), adopted);
                }
            }
        }

        Ok(dropped)
    }

    async fn adopt(&self, live: LiveJob) -> Option<OccupancyJob> {
        let manifest_path = self.generator.manifest_path(&live.name);
        let node = match live.node {
            Some(node) => Some(node),
            None => node_from_manifest(&manifest_path).await,
        };

        let Some(node) = node else {
            warn!(
                "Ignoring {}: no {} annotation and no readable manifest",
                live.name, NODE_ANNOTATION
            );
            return None;
        };

        Some(OccupancyJob {
            sku: live.sku.as_deref().and_then(SkuProfile::from_key),
            created: live.created.unwrap_or_else(Utc::now),
            message: "recovered from cluster".to_string(),
            name: live.name,
            node,
            manifest_path,
        })
    }

    /// Nodes currently targeted by a tracked job
    pub fn occupied_nodes(&self) -> HashSet<String> {
        self.tracked.values().map(|j| j.node.clone()).collect()
    }

    pub fn tracked_for_node(&self, node: &str) -> Option<&OccupancyJob> {
        self.tracked.values().find(|j| j.node == node)
    }

    /// Tracked jobs ordered by name
    pub fn list_tracked(&self) -> Vec<&OccupancyJob> {
        self.tracked.values().collect()
    }

    /// Render, write and submit a placeholder job for one node
    pub async fn occupy(&mut self, node: &GpuNode, sku: SkuProfile) -> OccupyResult<OccupancyJob> {
        self.ensure_unoccupied(&node.name)?;
        let manifest = self.generator.render(node, sku)?;
        let path = self.generator.write(&manifest).await?;
        self.submit(&manifest, &path).await
    }

    /// Apply a written manifest and track the job on success
    ///
    /// A failed apply leaves the manifest file in place for inspection.
    pub async fn submit(&mut self, manifest: &RenderedManifest, path: &Path) -> OccupyResult<OccupancyJob> {
        self.ensure_unoccupied(&manifest.node)?;
        info!(
            "Submitting {} ({} GPUs on {})",
            manifest.name, manifest.gpus, manifest.node
        );

        let output = self
            .cluster
            .apply_manifest(path)
            .await
            .map_err(|e| OccupyError::Submission {
                name: manifest.name.clone(),
                message: format!("{:#}", e),
            })?;

        if !output.success {
            return Err(OccupyError::Submission {
                name: manifest.name.clone(),
                message: output.message(),
            });
        }

        let job = OccupancyJob {
            name: manifest.name.clone(),
            node: manifest.node.clone(),
            sku: Some(manifest.sku),
            manifest_path: path.to_path_buf(),
            created: Utc::now(),
            message: output.message(),
        };
        self.tracked.insert(job.name.clone(), job.clone());
        Ok(job)
    }

    fn ensure_unoccupied(&self, node: &str) -> OccupyResult<()> {
        match self.tracked_for_node(node) {
            Some(existing) => Err(OccupyError::AlreadyOccupied {
                node: node.to_string(),
                job: existing.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Tracked jobs a selector would delete
    pub fn matching(&self, selector: &DeleteSelector) -> OccupyResult<Vec<&OccupancyJob>> {
        let regex = selector.compile()?;
        Ok(self
            .tracked
            .values()
            .filter(|job| regex.as_ref().map_or(true, |re| re.is_match(&job.name)))
            .collect())
    }

    /// Delete every tracked job matching the selector
    ///
    /// Returns one report per matched job in name order. A non-matching
    /// pattern yields an empty list.
    pub async fn delete(&mut self, selector: &DeleteSelector) -> OccupyResult<Vec<DeletionReport>> {
        let targets: Vec<OccupancyJob> = self.matching(selector)?.into_iter().cloned().collect();

        let mut reports = Vec::with_capacity(targets.len());
        for job in targets {
            info!("Deleting {} {} (node {})", self.kind, job.name, job.node);

            let cluster = match self.cluster.delete_resource(&self.kind, &job.name).await {
                Ok(output) if output.success => Ok(output.message()),
                Ok(output) => Err(OccupyError::Deletion {
                    name: job.name.clone(),
                    message: output.message(),
                }),
                Err(e) => Err(OccupyError::Deletion {
                    name: job.name.clone(),
                    message: format!("{:#}", e),
                }),
            };

            let manifest = remove_manifest(&job.name, &job.manifest_path).await;

            if cluster.is_ok() {
                self.tracked.remove(&job.name);
            }

            reports.push(DeletionReport {
                name: job.name,
                node: job.node,
                cluster,
                manifest,
            });
        }

        Ok(reports)
    }
}

async fn remove_manifest(name: &str, path: &Path) -> OccupyResult<String> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(format!("removed {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(format!("{} already absent", path.display()))
        }
        Err(e) => Err(OccupyError::Deletion {
            name: name.to_string(),
            message: format!("cannot remove {}: {}", path.display(), e),
        }),
    }
}

async fn node_from_manifest(path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
    doc["metadata"]["annotations"][NODE_ANNOTATION]
        .as_str()
        .map(str::to_string)
}
