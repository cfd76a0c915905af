mod detection_store;
mod jobs;
mod zones;

use thiserror::Error;

pub use detection_store::DetectionStore;
pub use jobs::{AnalysisJob, DetectionCounts, JobId, JobStatus, JobStore, StatusSnapshot};
pub use zones::{DetectionZone, ZoneStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("invalid zone: {0}")]
    InvalidZone(String),
}
