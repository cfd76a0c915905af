//! JSON messages exchanged over the live channel.
//!
//! Client commands are tagged by `action`, server messages by `type`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::{
    AnalysisSummary, FrameInsights, StageProgress, VehicleCounts, VehicleDetection,
};
use crate::storage::{DetectionCounts, JobId, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Pause,
    Resume,
    Restart,
    RequestStatus,
}

#[derive(Debug, Error)]
#[error("Invalid message format")]
pub struct MalformedControlMessage(#[source] serde_json::Error);

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self, MalformedControlMessage> {
        serde_json::from_str(text).map_err(MalformedControlMessage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressStats {
    pub frames_processed: u64,
    pub total_frames: u64,
    pub vehicles_detected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub overall_progress: f64,
    pub current_stage: u8,
    pub stage_percent: f64,
    pub stage_progress: StageProgress,
    pub stats: ProgressStats,
    pub detection_counts: DetectionCounts,
    /// Insights for the frame just analyzed; absent on periodic status ticks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_insights: Option<FrameInsights>,
}

impl ProgressUpdate {
    pub fn from_snapshot(job_id: JobId, snapshot: &StatusSnapshot) -> Self {
        Self {
            job_id,
            overall_progress: snapshot.overall_progress,
            current_stage: snapshot.current_stage,
            stage_percent: snapshot.stage_percent,
            stage_progress: snapshot.stage_progress,
            stats: ProgressStats {
                frames_processed: snapshot.frames_processed,
                total_frames: snapshot.total_frames,
                vehicles_detected: snapshot.vehicles_detected,
            },
            detection_counts: snapshot.detection_counts,
            frame_insights: None,
        }
    }

    pub fn with_frame_insights(mut self, insights: FrameInsights) -> Self {
        self.frame_insights = Some(insights);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameUpdate {
    pub frame_number: u64,
    pub timestamp: f64,
    /// Base64 JPEG of the annotated frame.
    pub frame: String,
    pub detections: Vec<VehicleDetection>,
    pub vehicle_counts: VehicleCounts,
    pub insights: FrameInsights,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        message: String,
    },
    StatusUpdate {
        status: StatusSnapshot,
    },
    ProgressUpdate(ProgressUpdate),
    FrameUpdate(FrameUpdate),
    ProcessingComplete {
        job_id: JobId,
        results_url: String,
        results: Box<AnalysisSummary>,
    },
    ProcessingError {
        job_id: JobId,
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn status(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn processing_complete(job_id: JobId, results: AnalysisSummary) -> Self {
        ServerMessage::ProcessingComplete {
            job_id,
            results_url: format!("/api/jobs/{job_id}/results"),
            results: Box::new(results),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
