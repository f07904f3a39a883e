/// Grouping idle nodes by SKU for preview and reporting
use std::collections::BTreeMap;

use tracing::{info, warn};

use super::error::OccupyError;
use super::sku::{classify_node, Classification, SkuProfile};
use crate::k8s::GpuNode;

/// Idle nodes grouped by instance family; one manifest per node
#[derive(Debug, Clone, Default)]
pub struct OccupancyPlan {
    pub batches: BTreeMap<SkuProfile, Vec<GpuNode>>,
    pub unclassified: Vec<GpuNode>,
}

impl OccupancyPlan {
    /// Classify candidates, setting aside unknown instance types
    pub fn build(nodes: Vec<GpuNode>) -> Self {
        let mut plan = Self::default();
        for node in nodes {
            match classify_node(&node) {
                Classification::Known(sku) => plan.batches.entry(sku).or_default().push(node),
                Classification::Unclassified(instance_type) => {
                    let skipped = OccupyError::Unclassified {
                        node: node.name.clone(),
                        instance_type,
                    };
                    warn!("Skipping: {}", skipped);
                    plan.unclassified.push(node);
                }
            }
        }
        plan
    }

    /// Keep only the batch for one SKU
    pub fn retain_sku(&mut self, sku: SkuProfile) {
        self.batches.retain(|key, _| *key == sku);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    pub fn gpu_count(&self) -> u32 {
        self.batches.values().flatten().map(GpuNode::gpu_free).sum()
    }

    /// (node, sku) pairs in submission order
    pub fn targets(&self) -> impl Iterator<Item = (&GpuNode, SkuProfile)> {
        self.batches
            .iter()
            .flat_map(|(sku, nodes)| nodes.iter().map(move |node| (node, *sku)))
    }

    /// Log the plan for the operator
    pub fn log_preview(&self) {
        for (sku, nodes) in &self.batches {
            let gpus: u32 = nodes.iter().map(GpuNode::gpu_free).sum();
            info!("  {}: {} node(s), {} GPU(s)", sku, nodes.len(), gpus);
            for node in nodes {
                info!("    - {} ({}/{} GPUs free)", node.name, node.gpu_free(), node.gpu_capacity);
            }
        }
        if !self.unclassified.is_empty() {
            let names: Vec<&str> = self.unclassified.iter().map(|n| n.name.as_str()).collect();
            warn!("  Unclassified (skipped): {}", names.join(", "));
        }
        info!(
            "  Total: {} node(s), {} GPU(s)",
            self.node_count(),
            self.gpu_count()
        );
    }
}
