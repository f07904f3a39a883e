/// Occupancy error types
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the occupancy subsystem.
///
/// Everything except `Config` and `Template` is scoped to a single node,
/// job or cycle and never stops a batch or a patrol run.
#[derive(Debug, Error)]
pub enum OccupyError {
    #[error("cluster query failed: {0}")]
    ClusterQuery(String),

    #[error("node {node} has unknown instance type '{instance_type}'")]
    Unclassified { node: String, instance_type: String },

    #[error("failed to write manifest {path}: {source}")]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to submit {name}: {message}")]
    Submission { name: String, message: String },

    #[error("failed to delete {name}: {message}")]
    Deletion { name: String, message: String },

    #[error("node {node} is already occupied by {job}")]
    AlreadyOccupied { node: String, job: String },

    #[error("invalid job name pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("manifest template error: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl OccupyError {
    /// Errors that make the subsystem unusable rather than failing one item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OccupyError::Config(_) | OccupyError::Template(_))
    }
}

pub type OccupyResult<T> = Result<T, OccupyError>;
