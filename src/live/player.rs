use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::ImageError;
use thiserror::Error;
use tokio::sync::mpsc;

use super::control::{SessionControl, Step};
use super::protocol::{FrameUpdate, ServerMessage};
use crate::analytics::{
    analyze_frame, encode_jpeg, DetectorError, FrameSource, SourceError, VehicleCounts, VehicleDetector,
};
use crate::storage::JobId;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A frame update with this number was sent.
    Sent(u64),
    Waiting,
    Restarted,
    Finished,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackOptions {
    /// Used for timestamps when the source reports no frame rate.
    pub assumed_fps: f64,
    /// Send annotated JPEG previews; otherwise `frame` is empty.
    pub preview: bool,
    pub speed_limit: f32,
}

/// Interactive playback of one job's video for one client.
///
/// Owns a private frame source and shares the detector with the worker.
/// Control signals are consumed before every frame read.
pub struct LivePlayer {
    job_id: JobId,
    source: Box<dyn FrameSource>,
    detector: VehicleDetector,
    control: Arc<SessionControl>,
    outgoing: mpsc::Sender<ServerMessage>,
    fps: f64,
    preview: bool,
    speed_limit: f32,
    frame_number: u64,
    counts: VehicleCounts,
    released: bool,
}

impl LivePlayer {
    pub fn new(
        job_id: JobId,
        source: Box<dyn FrameSource>,
        detector: VehicleDetector,
        control: Arc<SessionControl>,
        outgoing: mpsc::Sender<ServerMessage>,
        options: PlaybackOptions,
    ) -> Self {
        let fps = if source.fps() > 0.0 {
            source.fps()
        } else {
            options.assumed_fps
        };
        Self {
            job_id,
            source,
            detector,
            control,
            outgoing,
            fps,
            preview: options.preview,
            speed_limit: options.speed_limit,
            frame_number: 0,
            counts: VehicleCounts::default(),
            released: false,
        }
    }

    #[cfg(test)]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn step(&mut self) -> Result<StepOutcome, PlayerError> {
        match self.control.next_step() {
            Step::Stop => Ok(StepOutcome::Stopped),
            Step::Wait => Ok(StepOutcome::Waiting),
            Step::Restart => {
                self.source.rewind()?;
                self.frame_number = 0;
                self.counts = VehicleCounts::default();
                tracing::debug!(job = self.job_id, "playback restarted");
                Ok(StepOutcome::Restarted)
            }
            Step::Advance => self.advance(),
        }
    }

    fn advance(&mut self) -> Result<StepOutcome, PlayerError> {
        let Some(mut frame) = self.source.read_frame()? else {
            return Ok(StepOutcome::Finished);
        };

        let detections = self.detector.detect_frame(&mut frame)?;
        for det in &detections {
            self.counts.add(det.vehicle_type);
        }

        let insights = analyze_frame(&detections, frame.width, frame.height, self.speed_limit);
        let image = if self.preview {
            BASE64.encode(encode_jpeg(&frame.annotated(&detections)?)?)
        } else {
            String::new()
        };

        let number = self.frame_number;
        let update = FrameUpdate {
            frame_number: number,
            timestamp: number as f64 / self.fps,
            frame: image,
            detections,
            vehicle_counts: self.counts,
            insights,
        };
        if self
            .outgoing
            .blocking_send(ServerMessage::FrameUpdate(update))
            .is_err()
        {
            self.control.stop();
            return Ok(StepOutcome::Stopped);
        }

        self.frame_number += 1;
        Ok(StepOutcome::Sent(number))
    }

    /// Steps at a fixed cadence until the video ends or the session stops.
    /// A step slower than `interval` is followed immediately by the next
    /// one; lost time is not made up.
    pub fn run(mut self, interval: Duration) {
        tracing::debug!(job = self.job_id, "live playback started");
        loop {
            let started = Instant::now();
            match self.step() {
                Ok(StepOutcome::Finished) | Ok(StepOutcome::Stopped) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job = self.job_id, error = %e, "live playback failed");
                    let _ = self
                        .outgoing
                        .blocking_send(ServerMessage::error(e.to_string()));
                    break;
                }
            }
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
        self.release();
        tracing::debug!(job = self.job_id, frames = self.frame_number, "live playback ended");
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.source.release() {
            tracing::warn!(job = self.job_id, error = %e, "failed to release live source");
        }
    }
}

impl Drop for LivePlayer {
    fn drop(&mut self) {
        self.release();
    }
}
