use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::analytics::VehicleType;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("detector pass `{0}` has no classes")]
    EmptyPass(&'static str),
    #[error("vehicle class `{0}` is assigned to both detector passes")]
    OverlappingClass(&'static str),
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_upload_bytes() -> u64 {
    1_572_864_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl StorageConfig {
    pub fn video_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Thresholds for one detector invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct PassConfig {
    pub classes: Vec<VehicleType>,
    pub confidence: f32,
    pub iou: f32,
}

fn default_fine_pass() -> PassConfig {
    PassConfig {
        classes: vec![VehicleType::Bicycle],
        confidence: 0.2,
        iou: 0.3,
    }
}

fn default_main_pass() -> PassConfig {
    PassConfig {
        classes: vec![
            VehicleType::Car,
            VehicleType::Motorcycle,
            VehicleType::Bus,
            VehicleType::Truck,
        ],
        confidence: 0.5,
        iou: 0.45,
    }
}

fn default_model_path() -> String {
    "yolov8n.onnx".to_string()
}

fn default_input_size() -> u32 {
    640
}

fn default_intra_threads() -> usize {
    4
}

fn default_normalize_alpha() -> f32 {
    1.3
}

fn default_normalize_beta() -> f32 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default = "default_normalize_alpha")]
    pub normalize_alpha: f32,
    #[serde(default = "default_normalize_beta")]
    pub normalize_beta: f32,
    #[serde(default = "default_fine_pass")]
    pub fine_pass: PassConfig,
    #[serde(default = "default_main_pass")]
    pub main_pass: PassConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_size: default_input_size(),
            intra_threads: default_intra_threads(),
            normalize_alpha: default_normalize_alpha(),
            normalize_beta: default_normalize_beta(),
            fine_pass: default_fine_pass(),
            main_pass: default_main_pass(),
        }
    }
}

fn default_speed_limit() -> f32 {
    60.0
}

fn default_assumed_fps() -> f64 {
    30.0
}

fn default_queue_poll_ms() -> u64 {
    200
}

fn default_status_tick_ms() -> u64 {
    1000
}

fn default_publish_retry_ms() -> u64 {
    5000
}

fn default_live_fps() -> u32 {
    30
}

fn default_live_preview() -> bool {
    true
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_speed_limit")]
    pub speed_limit: f32,
    /// Used for exported timestamps when a job's native fps is unknown.
    #[serde(default = "default_assumed_fps")]
    pub assumed_fps: f64,
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,
    #[serde(default = "default_status_tick_ms")]
    pub status_tick_ms: u64,
    #[serde(default = "default_publish_retry_ms")]
    pub publish_retry_ms: u64,
    #[serde(default = "default_live_fps")]
    pub live_fps: u32,
    #[serde(default = "default_live_preview")]
    pub live_preview: bool,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl AnalysisConfig {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn status_tick(&self) -> Duration {
        Duration::from_millis(self.status_tick_ms)
    }

    pub fn publish_retry(&self) -> Duration {
        Duration::from_millis(self.publish_retry_ms)
    }

    pub fn live_frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.live_fps.max(1) as f64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            speed_limit: default_speed_limit(),
            assumed_fps: default_assumed_fps(),
            queue_poll_ms: default_queue_poll_ms(),
            status_tick_ms: default_status_tick_ms(),
            publish_retry_ms: default_publish_retry_ms(),
            live_fps: default_live_fps(),
            live_preview: default_live_preview(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        if !Path::new(DEFAULT_CONFIG_PATH).exists() {
            tracing::info!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
            return Ok(Self::default());
        }
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detector.fine_pass.classes.is_empty() {
            return Err(ConfigError::EmptyPass("fine_pass"));
        }
        if self.detector.main_pass.classes.is_empty() {
            return Err(ConfigError::EmptyPass("main_pass"));
        }
        if let Some(class) = self
            .detector
            .fine_pass
            .classes
            .iter()
            .find(|c| self.detector.main_pass.classes.contains(c))
        {
            return Err(ConfigError::OverlappingClass(class.as_str()));
        }
        if self.detector.input_size == 0 {
            return Err(ConfigError::Zero("detector.input_size"));
        }
        if self.analysis.live_fps == 0 {
            return Err(ConfigError::Zero("analysis.live_fps"));
        }
        if self.analysis.status_tick_ms == 0 {
            return Err(ConfigError::Zero("analysis.status_tick_ms"));
        }
        if self.analysis.queue_poll_ms == 0 {
            return Err(ConfigError::Zero("analysis.queue_poll_ms"));
        }
        if self.analysis.assumed_fps <= 0.0 {
            return Err(ConfigError::Zero("analysis.assumed_fps"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = Config::load_from(file.path()).unwrap();

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.storage.max_upload_bytes, 1_572_864_000);
        assert_eq!(config.detector.fine_pass.classes, vec![VehicleType::Bicycle]);
        assert_eq!(config.detector.fine_pass.confidence, 0.2);
        assert_eq!(config.detector.main_pass.iou, 0.45);
        assert_eq!(config.detector.normalize_alpha, 1.3);
        assert_eq!(config.analysis.live_fps, 30);
        assert_eq!(config.analysis.status_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_sections() {
        let file = write_config(
            r#"
            [http]
            port = 9000

            [detector.fine_pass]
            classes = ["motorcycle"]
            confidence = 0.25
            iou = 0.35

            [detector.main_pass]
            classes = ["car", "bus", "truck", "bicycle"]
            confidence = 0.6
            iou = 0.5

            [analysis]
            speed_limit = 50.0
            "#,
        );
        let config = Config::load_from(file.path()).unwrap();

        assert_eq!(config.http.port, 9000);
        assert_eq!(config.detector.fine_pass.classes, vec![VehicleType::Motorcycle]);
        assert_eq!(config.detector.main_pass.classes.len(), 4);
        assert_eq!(config.analysis.speed_limit, 50.0);
        assert_eq!(config.analysis.publish_retry_ms, 5000);
    }

    #[test]
    fn test_rejects_overlapping_passes() {
        let file = write_config(
            r#"
            [detector.fine_pass]
            classes = ["car"]
            confidence = 0.2
            iou = 0.3
            "#,
        );
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingClass("car")));
    }

    #[test]
    fn test_rejects_zero_live_fps() {
        let file = write_config("[analysis]\nlive_fps = 0\n");
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("analysis.live_fps")));
    }

    #[test]
    fn test_unknown_class_fails_to_parse() {
        let file = write_config(
            r#"
            [detector.fine_pass]
            classes = ["tram"]
            confidence = 0.2
            iou = 0.3
            "#,
        );
        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_live_frame_interval() {
        let config = AnalysisConfig::default();
        let interval = config.live_frame_interval();
        assert!(interval > Duration::from_millis(33) && interval < Duration::from_millis(34));
    }
}
