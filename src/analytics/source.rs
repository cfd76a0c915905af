use std::path::Path;

use thiserror::Error;

use super::frame::Frame;

#[derive(Debug, Error)]
pub enum SourceError {
    /// `path` is kept for logs only; the message is shown to users.
    #[error("could not open video: {reason}")]
    Unavailable { path: String, reason: String },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("release failed: {0}")]
    Release(String),
}

pub const MISSING_FILE: &str = "file does not exist";
pub const UNREADABLE_FILE: &str = "unsupported or corrupt video file";

/// Sequential, seekable reader over one video.
pub trait FrameSource: Send {
    /// Total frames as reported by the container; 0 when unknown.
    fn frame_count(&self) -> u64;

    /// Native frame rate; 0.0 when unknown.
    fn fps(&self) -> f64;

    /// Next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<(), SourceError>;

    /// Release the underlying handle. Further reads return `None`.
    fn release(&mut self) -> Result<(), SourceError>;
}

pub trait SourceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, SourceError>;
}

#[cfg(feature = "vision")]
pub use capture::{CaptureOpener, CaptureSource};

#[cfg(feature = "vision")]
mod capture {
    use std::path::Path;

    use opencv::core::Mat;
    use opencv::prelude::*;
    use opencv::videoio::{self, VideoCapture};

    use super::{Frame, FrameSource, SourceError, SourceOpener, MISSING_FILE, UNREADABLE_FILE};

    pub struct CaptureSource {
        capture: VideoCapture,
        mat: Mat,
        frame_count: u64,
        fps: f64,
        released: bool,
    }

    impl CaptureSource {
        pub fn open(path: &Path) -> Result<Self, SourceError> {
            let path_str = path.to_string_lossy().to_string();
            let unavailable = |reason: &str| SourceError::Unavailable {
                path: path_str.clone(),
                reason: reason.to_string(),
            };

            if !path.exists() {
                return Err(unavailable(MISSING_FILE));
            }

            let capture = VideoCapture::from_file(&path_str, videoio::CAP_ANY).map_err(|e| {
                tracing::debug!(path = %path_str, error = %e, "capture backend rejected file");
                unavailable(UNREADABLE_FILE)
            })?;
            if !capture.is_opened().unwrap_or(false) {
                return Err(unavailable(UNREADABLE_FILE));
            }

            let frame_count = capture
                .get(videoio::CAP_PROP_FRAME_COUNT)
                .unwrap_or(0.0)
                .max(0.0) as u64;
            let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0).max(0.0);

            tracing::debug!(path = %path_str, frame_count, fps, "opened video source");

            Ok(Self {
                capture,
                mat: Mat::default(),
                frame_count,
                fps,
                released: false,
            })
        }
    }

    impl FrameSource for CaptureSource {
        fn frame_count(&self) -> u64 {
            self.frame_count
        }

        fn fps(&self) -> f64 {
            self.fps
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.released {
                return Ok(None);
            }

            let ok = self
                .capture
                .read(&mut self.mat)
                .map_err(|e| SourceError::Read(e.to_string()))?;
            if !ok || self.mat.empty() {
                return Ok(None);
            }
            if self.mat.channels() != 3 {
                return Err(SourceError::Read(format!(
                    "unsupported channel count {}",
                    self.mat.channels()
                )));
            }

            let continuous;
            let mat = if self.mat.is_continuous() {
                &self.mat
            } else {
                continuous = self
                    .mat
                    .try_clone()
                    .map_err(|e| SourceError::Read(e.to_string()))?;
                &continuous
            };

            let data = mat
                .data_bytes()
                .map_err(|e| SourceError::Read(e.to_string()))?
                .to_vec();

            Ok(Some(Frame::new(mat.cols() as u32, mat.rows() as u32, data)))
        }

        fn rewind(&mut self) -> Result<(), SourceError> {
            let ok = self
                .capture
                .set(videoio::CAP_PROP_POS_FRAMES, 0.0)
                .map_err(|e| SourceError::Seek(e.to_string()))?;
            if !ok {
                return Err(SourceError::Seek("backend refused seek".to_string()));
            }
            Ok(())
        }

        fn release(&mut self) -> Result<(), SourceError> {
            if self.released {
                return Ok(());
            }
            self.released = true;
            self.capture
                .release()
                .map_err(|e| SourceError::Release(e.to_string()))
        }
    }

    impl Drop for CaptureSource {
        fn drop(&mut self) {
            if let Err(e) = self.release() {
                tracing::warn!(error = %e, "failed to release video source on drop");
            }
        }
    }

    pub struct CaptureOpener;

    impl SourceOpener for CaptureOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
            Ok(Box::new(CaptureSource::open(path)?))
        }
    }
}
