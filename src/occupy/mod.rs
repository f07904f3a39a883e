/// GPU occupancy: classification, manifests, job tracking and patrol
pub mod error;
pub mod jobs;
pub mod manifest;
pub mod patrol;
pub mod plan;
pub mod sku;
pub mod workflow;

pub use jobs::{DeleteSelector, JobManager};
pub use patrol::Patrol;
pub use sku::SkuProfile;
pub use workflow::{AutoConfirm, Confirm, StdinConfirm};
