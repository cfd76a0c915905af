use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::StoreError;
use crate::analytics::{overall_progress, AnalysisSummary, Stage, StageProgress, VehicleCounts};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub video_path: PathBuf,
    pub original_name: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Fraction in 0..=1.
    pub progress: f64,
    pub stage: Stage,
    pub stage_progress: StageProgress,
    pub frames_processed: u64,
    pub total_frames: u64,
    pub fps: f64,
    pub vehicles_detected: u64,
    pub counts: VehicleCounts,
    pub error_message: Option<String>,
    pub results: Option<AnalysisSummary>,
}

impl AnalysisJob {
    fn new(id: JobId, video_path: PathBuf, original_name: String) -> Self {
        Self {
            id,
            video_path,
            original_name,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: JobStatus::Pending,
            progress: 0.0,
            stage: Stage::Loading,
            stage_progress: StageProgress::default(),
            frames_processed: 0,
            total_frames: 0,
            fps: 0.0,
            vehicles_detected: 0,
            counts: VehicleCounts::default(),
            error_message: None,
            results: None,
        }
    }

    /// Moves to `stage` at `percent`. Overall progress never decreases.
    pub fn set_stage_progress(&mut self, stage: Stage, percent: f64) {
        if stage > self.stage {
            self.stage = stage;
        }
        self.stage_progress.advance(stage, percent);
        let overall = overall_progress(self.stage, self.stage_progress.get(self.stage)) / 100.0;
        if overall > self.progress {
            self.progress = overall;
        }
    }

    /// Back to a fresh pending job: no error, no progress, frame counter at 0.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.error_message = None;
        self.progress = 0.0;
        self.stage = Stage::Loading;
        self.stage_progress = StageProgress::default();
        self.frames_processed = 0;
        self.vehicles_detected = 0;
        self.counts = VehicleCounts::default();
        self.results = None;
        self.started_at = None;
        self.completed_at = None;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let stage_percent = self.stage_progress.get(self.stage);
        StatusSnapshot {
            status: self.status,
            progress: self.progress,
            overall_progress: overall_progress(self.stage, stage_percent),
            current_stage: self.stage.number(),
            stage: self.stage,
            stage_percent,
            stage_progress: self.stage_progress,
            frames_processed: self.frames_processed,
            total_frames: self.total_frames,
            vehicles_detected: self.vehicles_detected,
            detection_counts: DetectionCounts::from(&self.counts),
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectionCounts {
    pub cars: u64,
    pub trucks: u64,
    pub buses: u64,
    pub motorcycles: u64,
    pub bicycles: u64,
}

impl From<&VehicleCounts> for DetectionCounts {
    fn from(counts: &VehicleCounts) -> Self {
        Self {
            cars: counts.car,
            trucks: counts.truck,
            buses: counts.bus,
            motorcycles: counts.motorcycle,
            bicycles: counts.bicycle,
        }
    }
}

/// What `get_status` returns, over HTTP and over the live channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub progress: f64,
    pub overall_progress: f64,
    pub current_stage: u8,
    pub stage: Stage,
    pub stage_percent: f64,
    pub stage_progress: StageProgress,
    pub frames_processed: u64,
    pub total_frames: u64,
    pub vehicles_detected: u64,
    pub detection_counts: DetectionCounts,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct JobStore {
    jobs: Arc<RwLock<BTreeMap<JobId, AnalysisJob>>>,
    next_id: Arc<AtomicU64>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn create(&self, video_path: PathBuf, original_name: String) -> AnalysisJob {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = AnalysisJob::new(id, video_path, original_name);
        self.jobs.write().insert(id, job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> Option<AnalysisJob> {
        self.jobs.read().get(&id).cloned()
    }

    pub fn status(&self, id: JobId) -> Result<StatusSnapshot, StoreError> {
        self.jobs
            .read()
            .get(&id)
            .map(AnalysisJob::snapshot)
            .ok_or(StoreError::JobNotFound(id))
    }

    pub fn update<R>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut AnalysisJob) -> R,
    ) -> Result<R, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        Ok(f(job))
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Vec<AnalysisJob> {
        self.jobs.read().values().rev().take(limit).cloned().collect()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_sequential_ids() {
        let store = JobStore::new();
        let a = store.create(PathBuf::from("a.mp4"), "a.mp4".into());
        let b = store.create(PathBuf::from("b.mp4"), "b.mp4".into());
        assert_eq!(b.id, a.id + 1);
        assert_eq!(a.status, JobStatus::Pending);

        let recent: Vec<_> = store.list_recent(10).iter().map(|j| j.id).collect();
        assert_eq!(recent, vec![b.id, a.id]);
    }

    #[test]
    fn test_update_missing_job() {
        let store = JobStore::new();
        let err = store.update(42, |job| job.progress = 1.0).unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(42)));
        assert!(store.status(42).is_err());
    }

    #[test]
    fn test_progress_follows_stages_and_never_regresses() {
        let store = JobStore::new();
        let job = store.create(PathBuf::from("v.mp4"), "v.mp4".into());

        let mut last = 0.0;
        let steps = [
            (Stage::Loading, 100.0),
            (Stage::Extracting, 100.0),
            (Stage::Detecting, 40.0),
            (Stage::Detecting, 30.0),
            (Stage::Loading, 0.0),
            (Stage::Detecting, 100.0),
            (Stage::Analyzing, 100.0),
        ];
        for (stage, percent) in steps {
            let progress = store
                .update(job.id, |j| {
                    j.set_stage_progress(stage, percent);
                    j.progress
                })
                .unwrap();
            assert!(progress >= last);
            last = progress;
        }
        assert_eq!(last, 1.0);

        let snapshot = store.status(job.id).unwrap();
        assert_eq!(snapshot.current_stage, 4);
        assert_eq!(snapshot.overall_progress, 100.0);
        assert_eq!(snapshot.stage_progress.detecting, 100.0);
    }

    #[test]
    fn test_reset_for_retry_clears_error_and_counters() {
        let store = JobStore::new();
        let job = store.create(PathBuf::from("v.mp4"), "v.mp4".into());
        store
            .update(job.id, |j| {
                j.status = JobStatus::Failed;
                j.error_message = Some("Processing failed: boom".into());
                j.frames_processed = 120;
                j.counts.car = 7;
                j.set_stage_progress(Stage::Detecting, 50.0);
            })
            .unwrap();

        store.update(job.id, AnalysisJob::reset_for_retry).unwrap();

        let snapshot = store.status(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.error_message, None);
        assert_eq!(snapshot.frames_processed, 0);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.detection_counts.cars, 0);
        assert_eq!(snapshot.current_stage, 1);
    }

    #[test]
    fn test_snapshot_serializes_status_shape() {
        let store = JobStore::new();
        let job = store.create(PathBuf::from("v.mp4"), "v.mp4".into());
        let value = serde_json::to_value(store.status(job.id).unwrap()).unwrap();

        assert_eq!(value["status"], "pending");
        assert_eq!(value["stage_progress"]["loading"], 0.0);
        assert_eq!(value["detection_counts"]["motorcycles"], 0);
        assert!(value["error_message"].is_null());
    }
}
