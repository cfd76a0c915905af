use ndarray::Array4;
use opencv::core::{Mat, Scalar, Size, BORDER_CONSTANT, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;

use super::detector::{DetectionParams, Detector, DetectorError};
use super::frame::Frame;
use super::vehicle::VehicleDetection;
use super::yolo::{decode_predictions, Letterbox};
use crate::config::DetectorConfig;

const PAD_VALUE: f64 = 114.0;

/// YOLOv8 detector running on ONNX Runtime.
pub struct OnnxDetector {
    session: Session,
    input_size: u32,
}

impl OnnxDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let load = |e: ort::Error| DetectorError::Load(e.to_string());

        let builder = Session::builder()
            .map_err(load)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load)?
            .with_intra_threads(config.intra_threads)
            .map_err(load)?;

        let model_path = config.model_path.as_str();
        let session = if model_path.starts_with("http://") || model_path.starts_with("https://") {
            builder.commit_from_url(model_path).map_err(load)?
        } else {
            builder.commit_from_file(model_path).map_err(load)?
        };

        tracing::info!(model = %model_path, input_size = config.input_size, "detector loaded");

        Ok(Self {
            session,
            input_size: config.input_size,
        })
    }

    fn preprocess(&self, frame: &Frame) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let cv = |e: opencv::Error| DetectorError::Inference(e.to_string());

        let letterbox = Letterbox::fit(frame.width, frame.height, self.input_size);
        let (new_w, new_h) = letterbox.resized();
        let input = self.input_size as i32;

        let mut source = Mat::new_rows_cols_with_default(
            frame.height as i32,
            frame.width as i32,
            CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(cv)?;
        source.data_bytes_mut().map_err(cv)?.copy_from_slice(&frame.data);

        let mut resized = Mat::default();
        imgproc::resize(
            &source,
            &mut resized,
            Size::new(new_w, new_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )
        .map_err(cv)?;

        let pad_x = letterbox.pad_x as i32;
        let pad_y = letterbox.pad_y as i32;
        let mut padded = Mat::default();
        opencv::core::copy_make_border(
            &resized,
            &mut padded,
            pad_y,
            input - new_h - pad_y,
            pad_x,
            input - new_w - pad_x,
            BORDER_CONSTANT,
            Scalar::new(PAD_VALUE, PAD_VALUE, PAD_VALUE, 0.0),
        )
        .map_err(cv)?;

        let data = padded.data_bytes().map_err(cv)?;
        let side = self.input_size as usize;
        if data.len() < side * side * 3 {
            return Err(DetectorError::Inference("letterboxed frame too small".into()));
        }

        // BGR bytes into an RGB planar tensor.
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for y in 0..side {
            for x in 0..side {
                let idx = (y * side + x) * 3;
                tensor[[0, 0, y, x]] = data[idx + 2] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx] as f32 / 255.0;
            }
        }

        Ok((tensor, letterbox))
    }
}

impl Detector for OnnxDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        params: &DetectionParams,
    ) -> Result<Vec<VehicleDetection>, DetectorError> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }
        let infer = |e: ort::Error| DetectorError::Inference(e.to_string());

        let (input, letterbox) = self.preprocess(frame)?;
        let tensor = TensorRef::from_array_view(input.view()).map_err(infer)?;
        let outputs = self.session.run(ort::inputs![tensor]).map_err(infer)?;

        let predictions = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| DetectorError::Output(e.to_string()))?;
        let shape = predictions.shape().to_vec();
        let values = predictions.as_standard_layout();
        let flat = values
            .as_slice()
            .ok_or_else(|| DetectorError::Output("prediction tensor is not contiguous".into()))?;

        decode_predictions(flat, &shape, params, &letterbox)
    }
}
