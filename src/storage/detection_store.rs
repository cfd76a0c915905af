use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::JobId;
use crate::analytics::{BoundingBox, VehicleDetection, VehicleType};

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub id: u64,
    pub job_id: JobId,
    pub frame_number: u64,
    pub vehicle_type: VehicleType,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub speed: Option<f32>,
    pub recorded_at: DateTime<Utc>,
}

/// Per-frame detection records, grouped by job.
pub struct DetectionStore {
    jobs: Arc<RwLock<HashMap<JobId, Vec<DetectionRecord>>>>,
    next_id: Arc<AtomicU64>,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Stores every detection of one frame. Returns the ids in input order.
    pub fn insert_frame(
        &self,
        job_id: JobId,
        frame_number: u64,
        detections: &[VehicleDetection],
    ) -> Vec<u64> {
        if detections.is_empty() {
            return Vec::new();
        }
        let recorded_at = Utc::now();
        let mut jobs = self.jobs.write();
        let records = jobs.entry(job_id).or_default();
        detections
            .iter()
            .map(|det| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                records.push(DetectionRecord {
                    id,
                    job_id,
                    frame_number,
                    vehicle_type: det.vehicle_type,
                    confidence: det.confidence,
                    bbox: det.bbox,
                    speed: det.speed,
                    recorded_at,
                });
                id
            })
            .collect()
    }

    /// Records for a job ordered by frame number, then insertion.
    pub fn for_job(&self, job_id: JobId) -> Vec<DetectionRecord> {
        self.jobs.read().get(&job_id).cloned().unwrap_or_default()
    }

    pub fn count(&self, job_id: JobId) -> usize {
        self.jobs.read().get(&job_id).map_or(0, Vec::len)
    }

    /// Drops every record of a job. Returns how many were removed.
    pub fn remove_job(&self, job_id: JobId) -> usize {
        self.jobs.write().remove(&job_id).map_or(0, |r| r.len())
    }
}

impl Default for DetectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DetectionStore {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(x: f32) -> VehicleDetection {
        VehicleDetection::new(VehicleType::Car, 0.8, BoundingBox::new(x, 0.0, x + 10.0, 10.0))
    }

    #[test]
    fn test_insert_frame_keeps_order_per_job() {
        let store = DetectionStore::new();
        let first = store.insert_frame(1, 1, &[car(0.0), car(20.0)]);
        store.insert_frame(2, 1, &[car(5.0)]);
        let second = store.insert_frame(1, 2, &[car(40.0)]);

        assert_eq!(first.len(), 2);
        assert!(second[0] > first[1]);

        let records = store.for_job(1);
        let frames: Vec<_> = records.iter().map(|r| r.frame_number).collect();
        assert_eq!(frames, vec![1, 1, 2]);
        assert_eq!(records[1].bbox.x1, 20.0);
        assert_eq!(store.count(2), 1);
    }

    #[test]
    fn test_empty_frame_stores_nothing() {
        let store = DetectionStore::new();
        assert!(store.insert_frame(1, 1, &[]).is_empty());
        assert_eq!(store.count(1), 0);
        assert!(store.for_job(1).is_empty());
    }

    #[test]
    fn test_remove_job_is_scoped() {
        let store = DetectionStore::new();
        store.insert_frame(1, 1, &[car(0.0), car(1.0)]);
        store.insert_frame(2, 1, &[car(0.0)]);

        assert_eq!(store.remove_job(1), 2);
        assert_eq!(store.remove_job(1), 0);
        assert_eq!(store.count(1), 0);
        assert_eq!(store.count(2), 1);
    }

    #[test]
    fn test_clone_shares_records() {
        let store = DetectionStore::new();
        let handle = store.clone();
        handle.insert_frame(3, 7, &[car(0.0)]);
        assert_eq!(store.for_job(3)[0].frame_number, 7);
    }
}
