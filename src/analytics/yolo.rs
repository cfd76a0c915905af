//! YOLOv8 output decoding and non-maximum suppression.
//!
//! Kept free of the inference runtime so it builds and tests without the
//! `vision` feature.

use std::cmp::Ordering;

use super::detector::{DetectionParams, DetectorError};
use super::vehicle::{BoundingBox, VehicleDetection, VehicleType};

/// Scale and padding used to fit a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, input_size: u32) -> Self {
        let input = input_size as f32;
        let scale = (input / width.max(1) as f32).min(input / height.max(1) as f32);
        let (new_w, new_h) = Self::scaled(width, height, scale);
        Self {
            scale,
            pad_x: ((input_size as i32 - new_w) / 2) as f32,
            pad_y: ((input_size as i32 - new_h) / 2) as f32,
            width,
            height,
        }
    }

    /// Size of the frame after scaling, before padding.
    pub fn resized(&self) -> (i32, i32) {
        Self::scaled(self.width, self.height, self.scale)
    }

    fn scaled(width: u32, height: u32, scale: f32) -> (i32, i32) {
        (
            (width as f32 * scale).round() as i32,
            (height as f32 * scale).round() as i32,
        )
    }

    /// Maps a model-space centre box back to clamped frame coordinates.
    fn to_frame(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let fw = self.width as f32;
        let fh = self.height as f32;
        let x1 = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, fw);
        let y1 = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, fh);
        let x2 = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, fw);
        let y2 = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, fh);
        BoundingBox::new(x1, y1, x2, y2)
    }
}

/// Decodes a `[1, 4 + classes, anchors]` prediction tensor given as a flat
/// row-major slice. Each anchor keeps its best-scoring class; anchors whose
/// class is outside `params.classes` or whose score does not exceed
/// `params.confidence` are dropped before suppression.
pub fn decode_predictions(
    output: &[f32],
    shape: &[usize],
    params: &DetectionParams,
    letterbox: &Letterbox,
) -> Result<Vec<VehicleDetection>, DetectorError> {
    let (attrs, anchors) = match shape {
        [1, attrs, anchors] if *attrs > 4 => (*attrs, *anchors),
        _ => {
            return Err(DetectorError::Output(format!(
                "expected [1, 4 + classes, anchors], got {shape:?}"
            )))
        }
    };
    if output.len() != attrs * anchors {
        return Err(DetectorError::Output(format!(
            "tensor has {} values, shape {shape:?} needs {}",
            output.len(),
            attrs * anchors
        )));
    }

    let at = |attr: usize, anchor: usize| output[attr * anchors + anchor];
    let mut candidates = Vec::new();

    for i in 0..anchors {
        let mut best_score = f32::MIN;
        let mut best_class = 0usize;
        for class in 0..attrs - 4 {
            let score = at(4 + class, i);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }

        if best_score <= params.confidence {
            continue;
        }
        let Some(vehicle_type) = VehicleType::from_coco_id(best_class) else {
            continue;
        };
        if !params.classes.contains(&vehicle_type) {
            continue;
        }

        let bbox = letterbox.to_frame(at(0, i), at(1, i), at(2, i), at(3, i));
        candidates.push(VehicleDetection::new(vehicle_type, best_score, bbox));
    }

    Ok(non_max_suppression(candidates, params.iou))
}

/// Greedy per-class suppression: highest confidence first, later boxes of
/// the same class overlapping a kept one by more than `iou` are dropped.
pub fn non_max_suppression(
    mut detections: Vec<VehicleDetection>,
    iou: f32,
) -> Vec<VehicleDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<VehicleDetection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.vehicle_type == det.vehicle_type && k.bbox.iou(&det.bbox) > iou);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}
