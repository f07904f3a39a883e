/// GPU instance classification
use std::fmt;

use crate::k8s::GpuNode;

/// Known GPU instance families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkuProfile {
    P5en,
    P5e,
    P5,
    P4d,
    P4de,
    G5,
}

/// Outcome of classifying an instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Known(SkuProfile),
    Unclassified(String),
}

impl SkuProfile {
    pub const ALL: [SkuProfile; 6] = [
        SkuProfile::P5en,
        SkuProfile::P5e,
        SkuProfile::P5,
        SkuProfile::P4d,
        SkuProfile::P4de,
        SkuProfile::G5,
    ];

    /// Instance family key, as it appears in `p5.48xlarge`
    pub fn key(self) -> &'static str {
        match self {
            SkuProfile::P5en => "p5en",
            SkuProfile::P5e => "p5e",
            SkuProfile::P5 => "p5",
            SkuProfile::P4d => "p4d",
            SkuProfile::P4de => "p4de",
            SkuProfile::G5 => "g5",
        }
    }

    /// GPU class display name
    pub fn gpu_class(self) -> &'static str {
        match self {
            SkuProfile::P5en | SkuProfile::P5e => "H200",
            SkuProfile::P5 => "H100",
            SkuProfile::P4d => "A100",
            SkuProfile::P4de => "A100-80G",
            SkuProfile::G5 => "A10G",
        }
    }

    /// GPUs per node on the 48xlarge/24xlarge sizes
    pub fn gpu_count(self) -> u32 {
        8
    }

    /// EFA interfaces per node
    pub fn efa_interfaces(self) -> u32 {
        match self {
            SkuProfile::P5en => 16,
            SkuProfile::P5e | SkuProfile::P5 => 32,
            SkuProfile::P4d | SkuProfile::P4de => 4,
            SkuProfile::G5 => 1,
        }
    }

    pub fn from_key(key: &str) -> Option<SkuProfile> {
        Self::ALL.into_iter().find(|sku| sku.key() == key)
    }
}

impl fmt::Display for SkuProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({})", self.gpu_count(), self.gpu_class(), self.key())
    }
}

/// Map an instance-type label to a SKU profile.
///
/// Accepts SageMaker HyperPod names (`ml.p5.48xlarge`), EC2 names
/// (`p5.48xlarge`) and bare family keys (`p5`).
pub fn classify(instance_type: &str) -> Classification {
    let family = instance_type
        .trim()
        .strip_prefix("ml.")
        .unwrap_or(instance_type.trim())
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    match SkuProfile::from_key(&family) {
        Some(sku) => Classification::Known(sku),
        None => Classification::Unclassified(instance_type.to_string()),
    }
}

pub fn classify_node(node: &GpuNode) -> Classification {
    classify(&node.instance_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_instance_types() {
        assert_eq!(classify("ml.p5.48xlarge"), Classification::Known(SkuProfile::P5));
        assert_eq!(classify("ml.p5en.48xlarge"), Classification::Known(SkuProfile::P5en));
        assert_eq!(classify("p5e.48xlarge"), Classification::Known(SkuProfile::P5e));
        assert_eq!(classify("ml.p4de.24xlarge"), Classification::Known(SkuProfile::P4de));
        assert_eq!(classify("p4d"), Classification::Known(SkuProfile::P4d));
        assert_eq!(classify("ml.g5.48xlarge"), Classification::Known(SkuProfile::G5));
    }

    #[test]
    fn test_unknown_instance_type_is_unclassified() {
        assert_eq!(
            classify("ml.trn1.32xlarge"),
            Classification::Unclassified("ml.trn1.32xlarge".to_string())
        );
        assert_eq!(
            classify("unknown"),
            Classification::Unclassified("unknown".to_string())
        );
        // family prefixes must match exactly
        assert!(matches!(classify("p5x.48xlarge"), Classification::Unclassified(_)));
    }

    #[test]
    fn test_profile_table() {
        assert_eq!(SkuProfile::P5.gpu_class(), "H100");
        assert_eq!(SkuProfile::P5.gpu_count(), 8);
        assert_eq!(SkuProfile::P4de.gpu_class(), "A100-80G");
        assert_eq!(SkuProfile::P5e.efa_interfaces(), 32);
        assert_eq!(SkuProfile::P5.to_string(), "8×H100 (p5)");

        for sku in SkuProfile::ALL {
            assert_eq!(SkuProfile::from_key(sku.key()), Some(sku));
        }
    }
}
