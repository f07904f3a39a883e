/// Kubernetes cluster operations
pub mod client;
#[cfg(test)]
pub mod fake;
pub mod models;
pub mod nodes;

pub use client::{ClusterClient, KubernetesClient};
pub use nodes::{GpuNode, NodeInventory};
