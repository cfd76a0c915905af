use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use super::detector::VehicleDetector;
use super::insights::{AnalysisSummary, TrafficAggregator};
use super::progress::Stage;
use super::source::{FrameSource, SourceOpener};
use super::AnalysisError;
use crate::live::{ProgressHub, ProgressUpdate, ServerMessage};
use crate::storage::{AnalysisJob, DetectionStore, JobId, JobStatus, JobStore, ZoneStore};

const FAILURE_PREFIX: &str = "Processing failed";

/// Runs one job from video file to stored summary.
pub struct JobProcessor {
    jobs: JobStore,
    detections: DetectionStore,
    zones: ZoneStore,
    hub: ProgressHub,
    opener: Arc<dyn SourceOpener>,
    detector: VehicleDetector,
    speed_limit: f32,
}

impl JobProcessor {
    pub fn new(
        jobs: JobStore,
        detections: DetectionStore,
        zones: ZoneStore,
        hub: ProgressHub,
        opener: Arc<dyn SourceOpener>,
        detector: VehicleDetector,
        speed_limit: f32,
    ) -> Self {
        Self {
            jobs,
            detections,
            zones,
            hub,
            opener,
            detector,
            speed_limit,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Processes `job_id` to completion. `cancel` is checked before every
    /// frame read. The video source is released on every exit path.
    pub fn process(&self, job_id: JobId, cancel: &AtomicBool) -> Result<AnalysisSummary, AnalysisError> {
        let video_path = self.jobs.update(job_id, |job| {
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            job.error_message = None;
            job.set_stage_progress(Stage::Loading, 0.0);
            job.video_path.clone()
        })?;
        tracing::info!(job = job_id, path = %video_path.display(), "processing started");

        let mut source = self.opener.open(&video_path).map_err(|e| {
            tracing::warn!(job = job_id, path = %video_path.display(), error = %e, "video source unavailable");
            e
        })?;
        let result = self.run(job_id, source.as_mut(), cancel);
        if let Err(e) = source.release() {
            tracing::warn!(job = job_id, error = %e, "failed to release video source");
        }
        let summary = result?;

        self.jobs.update(job_id, |job| {
            job.set_stage_progress(Stage::Analyzing, 100.0);
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.results = Some(summary.clone());
        })?;
        self.publish(
            job_id,
            ServerMessage::processing_complete(job_id, summary.clone()),
        );

        tracing::info!(
            job = job_id,
            frames = summary.frames_analyzed,
            vehicles = summary.total_vehicles,
            "processing completed"
        );
        Ok(summary)
    }

    fn run(
        &self,
        job_id: JobId,
        source: &mut dyn FrameSource,
        cancel: &AtomicBool,
    ) -> Result<AnalysisSummary, AnalysisError> {
        self.advance(job_id, Stage::Loading, 100.0)?;

        let total_frames = source.frame_count();
        let fps = source.fps();
        self.jobs.update(job_id, |job| {
            job.total_frames = total_frames;
            job.fps = fps;
            job.set_stage_progress(Stage::Extracting, 0.0);
        })?;
        let zones = self.zones.ensure_default(job_id);
        let mut aggregator = TrafficAggregator::new(self.speed_limit, zones);
        self.advance(job_id, Stage::Extracting, 100.0)?;
        tracing::debug!(job = job_id, total_frames, fps, "video metadata read");

        let mut frame_number = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(AnalysisError::Cancelled(job_id));
            }
            let Some(mut frame) = source.read_frame()? else {
                break;
            };
            frame_number += 1;

            let detections = self.detector.detect_frame(&mut frame)?;
            self.detections.insert_frame(job_id, frame_number, &detections);

            let timestamp = if fps > 0.0 {
                frame_number as f64 / fps
            } else {
                0.0
            };
            let insights = aggregator.record_frame(timestamp, &detections, frame.width, frame.height);
            let counts = aggregator.counts();

            let percent = if total_frames > 0 {
                frame_number as f64 / total_frames as f64 * 100.0
            } else {
                0.0
            };
            let snapshot = self.jobs.update(job_id, |job| {
                job.frames_processed = frame_number;
                job.counts = counts;
                job.vehicles_detected = counts.total();
                job.set_stage_progress(Stage::Detecting, percent);
                job.snapshot()
            })?;
            self.publish(
                job_id,
                ServerMessage::ProgressUpdate(
                    ProgressUpdate::from_snapshot(job_id, &snapshot).with_frame_insights(insights),
                ),
            );

            tracing::trace!(job = job_id, frame = frame_number, detections = detections.len(), "frame analyzed");
        }

        self.advance(job_id, Stage::Detecting, 100.0)?;
        self.advance(job_id, Stage::Analyzing, 0.0)?;
        Ok(aggregator.summary())
    }

    /// Marks the job failed with a user-visible message and purges its detections.
    pub fn fail(&self, job_id: JobId, reason: &str) {
        let message = format!("{FAILURE_PREFIX}: {reason}");
        let purged = self.detections.remove_job(job_id);

        if let Err(e) = self.jobs.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(message.clone());
            job.completed_at = Some(Utc::now());
        }) {
            tracing::warn!(job = job_id, error = %e, "could not record failure");
            return;
        }

        tracing::error!(job = job_id, error = %reason, purged, "processing failed");
        self.publish(job_id, ServerMessage::ProcessingError { job_id, message });
    }

    /// Resets a failed job to a fresh pending one and drops its detections.
    pub fn reset_for_retry(&self, job_id: JobId) -> Result<(), AnalysisError> {
        self.jobs.update(job_id, AnalysisJob::reset_for_retry)?;
        let purged = self.detections.remove_job(job_id);
        tracing::info!(job = job_id, purged, "job reset for retry");
        Ok(())
    }

    fn advance(&self, job_id: JobId, stage: Stage, percent: f64) -> Result<(), AnalysisError> {
        self.jobs
            .update(job_id, |job| job.set_stage_progress(stage, percent))?;
        Ok(())
    }

    fn publish(&self, job_id: JobId, message: ServerMessage) {
        // Nobody watching is normal for background jobs.
        let _ = self.hub.publish(job_id, message);
    }
}
