//! In-memory detector and frame source used by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::detector::{DetectionParams, Detector, DetectorError};
use super::frame::Frame;
use super::source::{FrameSource, SourceError, SourceOpener, MISSING_FILE};
use super::vehicle::VehicleDetection;

pub const FAKE_WIDTH: u32 = 64;
pub const FAKE_HEIGHT: u32 = 48;

/// Returns the scripted detections whose class the pass asked for.
pub struct ScriptedDetector {
    detections: Vec<VehicleDetection>,
    failure: Option<String>,
    delay: Duration,
    calls: Arc<Mutex<Vec<DetectionParams>>>,
    last_frame: Arc<Mutex<Option<Frame>>>,
}

impl ScriptedDetector {
    pub fn new(detections: Vec<VehicleDetection>) -> Self {
        Self {
            detections,
            failure: None,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            last_frame: Arc::new(Mutex::new(None)),
        }
    }

    pub fn failing(message: &str) -> Self {
        let mut detector = Self::new(Vec::new());
        detector.failure = Some(message.to_string());
        detector
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<DetectionParams>>> {
        Arc::clone(&self.calls)
    }

    pub fn last_frame(&self) -> Arc<Mutex<Option<Frame>>> {
        Arc::clone(&self.last_frame)
    }
}

impl Detector for ScriptedDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        params: &DetectionParams,
    ) -> Result<Vec<VehicleDetection>, DetectorError> {
        self.calls.lock().push(params.clone());
        *self.last_frame.lock() = Some(frame.clone());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(message) = &self.failure {
            return Err(DetectorError::Inference(message.clone()));
        }
        Ok(self
            .detections
            .iter()
            .filter(|d| params.classes.contains(&d.vehicle_type))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Opened(PathBuf),
    Released(PathBuf),
}

pub type SourceLog = Arc<Mutex<Vec<SourceEvent>>>;

/// Synthetic clip of uniform gray frames.
pub struct FakeSource {
    path: PathBuf,
    total: u64,
    position: u64,
    fps: f64,
    released: bool,
    log: SourceLog,
}

impl FakeSource {
    pub fn new(total: u64, fps: f64) -> Self {
        Self {
            path: PathBuf::from("fake.mp4"),
            total,
            position: 0,
            fps,
            released: false,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self) -> SourceLog {
        Arc::clone(&self.log)
    }
}

impl FrameSource for FakeSource {
    fn frame_count(&self) -> u64 {
        self.total
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.released || self.position >= self.total {
            return Ok(None);
        }
        self.position += 1;
        let size = (FAKE_WIDTH * FAKE_HEIGHT * 3) as usize;
        Ok(Some(Frame::new(FAKE_WIDTH, FAKE_HEIGHT, vec![50; size])))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.position = 0;
        Ok(())
    }

    fn release(&mut self) -> Result<(), SourceError> {
        if !self.released {
            self.released = true;
            self.log.lock().push(SourceEvent::Released(self.path.clone()));
        }
        Ok(())
    }
}

/// Opens registered clips by path; anything else is unavailable.
#[derive(Clone, Default)]
pub struct FakeOpener {
    clips: Arc<Mutex<HashMap<PathBuf, (u64, f64)>>>,
    log: SourceLog,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_clip(&self, path: impl Into<PathBuf>, frames: u64, fps: f64) {
        self.clips.lock().insert(path.into(), (frames, fps));
    }

    pub fn log(&self) -> SourceLog {
        Arc::clone(&self.log)
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
        let (frames, fps) = self.clips.lock().get(path).copied().ok_or_else(|| {
            SourceError::Unavailable {
                path: path.display().to_string(),
                reason: MISSING_FILE.to_string(),
            }
        })?;
        self.log.lock().push(SourceEvent::Opened(path.to_path_buf()));
        let mut source = FakeSource::new(frames, fps);
        source.path = path.to_path_buf();
        source.log = Arc::clone(&self.log);
        Ok(Box::new(source))
    }
}
