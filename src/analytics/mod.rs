mod detector;
mod frame;
mod insights;
#[cfg(feature = "vision")]
mod onnx;
mod pipeline;
mod progress;
mod source;
mod vehicle;
#[cfg(any(test, feature = "vision"))]
mod yolo;

#[cfg(test)]
pub mod testing;

use thiserror::Error;

#[cfg(any(test, feature = "vision"))]
pub use detector::shared;
#[cfg(test)]
pub use detector::{DetectionParams, Detector};
pub use detector::{DetectorError, SharedDetector, VehicleDetector};
pub use frame::encode_jpeg;
#[cfg(test)]
pub use frame::Frame;
#[cfg(test)]
pub use insights::CongestionLevel;
pub use insights::{analyze_frame, AnalysisSummary, FrameInsights};
#[cfg(feature = "vision")]
pub use onnx::OnnxDetector;
pub use pipeline::JobProcessor;
pub use progress::{overall_progress, Stage, StageProgress};
#[cfg(feature = "vision")]
pub use source::CaptureOpener;
pub use source::{FrameSource, SourceError, SourceOpener};
pub use vehicle::{BoundingBox, VehicleCounts, VehicleDetection, VehicleType};

use crate::storage::{JobId, StoreError};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{0}")]
    Source(#[from] SourceError),
    #[error("{0}")]
    Detector(#[from] DetectorError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("job {0} was interrupted by shutdown")]
    Cancelled(JobId),
}
