use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::frame::Frame;
use super::vehicle::{VehicleDetection, VehicleType};
use crate::config::{DetectorConfig, PassConfig};

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model load failed: {0}")]
    Load(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// Class filter and thresholds for one detector invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    pub classes: Vec<VehicleType>,
    pub confidence: f32,
    pub iou: f32,
}

impl From<&PassConfig> for DetectionParams {
    fn from(pass: &PassConfig) -> Self {
        Self {
            classes: pass.classes.clone(),
            confidence: pass.confidence,
            iou: pass.iou,
        }
    }
}

/// Opaque object detection capability.
pub trait Detector: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        params: &DetectionParams,
    ) -> Result<Vec<VehicleDetection>, DetectorError>;
}

/// One model instance shared by the worker and every live session.
pub type SharedDetector = Arc<Mutex<Box<dyn Detector>>>;

#[cfg(any(test, feature = "vision"))]
pub fn shared(detector: impl Detector + 'static) -> SharedDetector {
    Arc::new(Mutex::new(Box::new(detector)))
}

/// Runs the fine and main passes over a frame and merges the results.
#[derive(Clone)]
pub struct VehicleDetector {
    detector: SharedDetector,
    fine: DetectionParams,
    main: DetectionParams,
    normalize_alpha: f32,
    normalize_beta: f32,
}

impl VehicleDetector {
    pub fn new(detector: SharedDetector, config: &DetectorConfig) -> Self {
        Self {
            detector,
            fine: DetectionParams::from(&config.fine_pass),
            main: DetectionParams::from(&config.main_pass),
            normalize_alpha: config.normalize_alpha,
            normalize_beta: config.normalize_beta,
        }
    }

    /// Normalizes `frame` in place, then detects. Fine pass results come first.
    pub fn detect_frame(&self, frame: &mut Frame) -> Result<Vec<VehicleDetection>, DetectorError> {
        frame.normalize(self.normalize_alpha, self.normalize_beta);

        let (fine, main) = {
            let mut detector = self.detector.lock();
            let fine = detector.detect(frame, &self.fine)?;
            let main = detector.detect(frame, &self.main)?;
            (fine, main)
        };

        let mut merged = Vec::with_capacity(fine.len() + main.len());
        merged.extend(fine);
        merged.extend(main);
        merged.retain(|det| match self.threshold_for(det.vehicle_type) {
            Some(threshold) => det.confidence > threshold,
            None => false,
        });

        Ok(merged)
    }

    fn threshold_for(&self, vehicle_type: VehicleType) -> Option<f32> {
        if self.fine.classes.contains(&vehicle_type) {
            Some(self.fine.confidence)
        } else if self.main.classes.contains(&vehicle_type) {
            Some(self.main.confidence)
        } else {
            None
        }
    }
}
