use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod config;
mod live;
mod storage;
mod worker;

use analytics::{JobProcessor, SharedDetector, SourceOpener, VehicleDetector};
use api::AppState;
use config::Config;
use live::{MonitorRegistry, ProgressHub};
use storage::{DetectionStore, JobStore, ZoneStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("roadwatch=debug".parse()?))
        .init();

    let config = Config::load()?;
    let video_dir = config.storage.video_dir();
    std::fs::create_dir_all(&video_dir)?;
    tracing::info!(dir = %video_dir.display(), "video storage ready");

    let (opener, detector) = vision_backends(&config)?;
    let detector = VehicleDetector::new(detector, &config.detector);

    let jobs = JobStore::new();
    let detections = DetectionStore::new();
    let zones = ZoneStore::new();
    let hub = ProgressHub::new();

    let processor = Arc::new(JobProcessor::new(
        jobs.clone(),
        detections.clone(),
        zones.clone(),
        hub.clone(),
        Arc::clone(&opener),
        detector.clone(),
        config.analysis.speed_limit,
    ));
    let (queue, worker) = worker::spawn_worker(processor, config.analysis.queue_poll());
    let monitors = MonitorRegistry::new(
        jobs.clone(),
        hub.clone(),
        config.analysis.status_tick(),
        config.analysis.publish_retry(),
    );

    let state = AppState {
        jobs,
        detections,
        zones,
        hub,
        monitors,
        queue,
        opener,
        detector,
        analysis: Arc::new(config.analysis.clone()),
        video_dir,
        max_upload_bytes: config.storage.max_upload_bytes,
    };

    let port = config.http.port;
    tokio::select! {
        result = api::start_server(state, port) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    worker.stop(config.analysis.shutdown_timeout()).await;
    tracing::info!("shutdown complete");

    Ok(())
}

#[cfg(feature = "vision")]
fn vision_backends(
    config: &Config,
) -> Result<(Arc<dyn SourceOpener>, SharedDetector), Box<dyn std::error::Error>> {
    let detector = analytics::OnnxDetector::new(&config.detector)?;
    Ok((Arc::new(analytics::CaptureOpener), analytics::shared(detector)))
}

#[cfg(not(feature = "vision"))]
fn vision_backends(
    _config: &Config,
) -> Result<(Arc<dyn SourceOpener>, SharedDetector), Box<dyn std::error::Error>> {
    Err("roadwatch was built without the `vision` feature; rebuild with `--features vision` to enable video decoding and detection".into())
}
