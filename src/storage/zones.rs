use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{JobId, StoreError};

pub const FULL_FRAME_ZONE: &str = "Full Frame";

/// Polygonal region of interest. Points are normalised to 0..1 of the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionZone {
    pub job_id: JobId,
    pub name: String,
    pub points: Vec<[f32; 2]>,
}

impl DetectionZone {
    pub fn new(job_id: JobId, name: impl Into<String>, points: Vec<[f32; 2]>) -> Self {
        Self {
            job_id,
            name: name.into(),
            points,
        }
    }

    pub fn full_frame(job_id: JobId) -> Self {
        Self::new(
            job_id,
            FULL_FRAME_ZONE,
            vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
        )
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidZone("zone name is empty".into()));
        }
        if self.points.len() < 3 {
            return Err(StoreError::InvalidZone(format!(
                "zone needs at least 3 points, got {}",
                self.points.len()
            )));
        }
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        if !self.points.iter().all(|[x, y]| in_range(*x) && in_range(*y)) {
            return Err(StoreError::InvalidZone(
                "zone points must lie within 0..1".into(),
            ));
        }
        Ok(())
    }

    /// Even-odd ray cast. Points on the polygon's outer edge count as inside.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        if self.on_edge(x, y) {
            return true;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    fn on_edge(&self, x: f32, y: f32) -> bool {
        const EPS: f32 = 1e-6;
        let n = self.points.len();
        (0..n).any(|i| {
            let [ax, ay] = self.points[i];
            let [bx, by] = self.points[(i + 1) % n];
            let cross = (bx - ax) * (y - ay) - (by - ay) * (x - ax);
            cross.abs() <= EPS
                && x >= ax.min(bx) - EPS
                && x <= ax.max(bx) + EPS
                && y >= ay.min(by) - EPS
                && y <= ay.max(by) + EPS
        })
    }
}

#[derive(Clone, Default)]
pub struct ZoneStore {
    zones: Arc<RwLock<HashMap<JobId, Vec<DetectionZone>>>>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zones of a job, creating the full-frame zone if it has none.
    pub fn ensure_default(&self, job_id: JobId) -> Vec<DetectionZone> {
        let mut zones = self.zones.write();
        let entry = zones.entry(job_id).or_default();
        if entry.is_empty() {
            entry.push(DetectionZone::full_frame(job_id));
        }
        entry.clone()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<DetectionZone> {
        self.zones.read().get(&job_id).cloned().unwrap_or_default()
    }

    /// Adds a zone, replacing any zone of the same name on that job.
    pub fn add(&self, zone: DetectionZone) -> Result<(), StoreError> {
        zone.validate()?;
        let mut zones = self.zones.write();
        let entry = zones.entry(zone.job_id).or_default();
        match entry.iter_mut().find(|z| z.name == zone.name) {
            Some(existing) => *existing = zone,
            None => entry.push(zone),
        }
        Ok(())
    }
}
