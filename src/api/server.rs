use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower_http::services::ServeDir;

use crate::analytics::{BoundingBox, SourceOpener, VehicleDetector, VehicleType};
use crate::config::AnalysisConfig;
use crate::live::{MonitorRegistry, ProgressHub};
use crate::storage::{
    DetectionStore, DetectionZone, JobId, JobStatus, JobStore, StatusSnapshot, ZoneStore,
};
use crate::worker::{JobQueue, QueueError};

use super::ws;

const RECENT_JOBS: usize = 50;
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;
const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Embed)]
#[folder = "src/assets/"]
struct Assets;

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobStore,
    pub detections: DetectionStore,
    pub zones: ZoneStore,
    pub hub: ProgressHub,
    pub monitors: MonitorRegistry,
    pub queue: JobQueue,
    pub opener: Arc<dyn SourceOpener>,
    pub detector: VehicleDetector,
    pub analysis: Arc<AnalysisConfig>,
    pub video_dir: PathBuf,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Error)]
enum UploadError {
    #[error("upload exceeds {0} bytes")]
    TooLarge(u64),
    #[error("failed to store upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),
}

impl UploadError {
    fn status(&self) -> StatusCode {
        match self {
            UploadError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Multipart(e) => e.status(),
        }
    }
}

#[derive(Serialize)]
struct JobCreated {
    job_id: JobId,
    status: JobStatus,
    queued: bool,
    status_url: String,
    live_url: String,
}

#[derive(Serialize)]
struct JobListItem {
    id: JobId,
    original_name: String,
    status: JobStatus,
    progress: f64,
    detections_stored: usize,
    created_at: DateTime<Utc>,
    video_url: Option<String>,
    error_message: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: JobId,
    queued: bool,
    status: StatusSnapshot,
}

#[derive(Debug, Serialize)]
struct ExportedDetection {
    frame_number: u64,
    timestamp: f64,
    vehicle_type: VehicleType,
    confidence: f32,
    bbox: BoundingBox,
    speed: f32,
    recorded_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct NewZone {
    name: String,
    points: Vec<[f32; 2]>,
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let media = ServeDir::new(&state.video_dir);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/assets/{*path}", get(static_handler))
        .route(
            "/api/jobs",
            get(list_jobs_handler)
                .post(upload_handler)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/jobs/{id}/process", axum::routing::post(process_handler))
        .route("/api/jobs/{id}/status", get(status_handler))
        .route("/api/jobs/{id}/results", get(results_handler))
        .route("/api/jobs/{id}/detections", get(detections_handler))
        .route(
            "/api/jobs/{id}/zones",
            get(zones_handler).post(add_zone_handler),
        )
        .route("/ws/jobs/{id}", get(ws::job_socket))
        .nest_service("/media", media)
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn index_handler() -> impl IntoResponse {
    match Assets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "index.html not found").into_response(),
    }
}

async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    match Assets::get(&path) {
        Some(content) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn upload_handler(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (e.status(), e.body_text()).into_response(),
        };
        if field.name() != Some("video") {
            continue;
        }

        let original_name = sanitize_file_name(field.file_name().unwrap_or_default());
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let (file, path) = match create_unique(&state.video_dir, &stamp, &original_name).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(error = %e, "could not create upload file");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };
        let stored_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match save_field(field, file, state.max_upload_bytes).await {
            Ok(bytes) => {
                tracing::info!(file = %stored_name, bytes, "upload stored");
            }
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&path).await {
                    if remove.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(file = %stored_name, error = %remove, "failed to remove partial upload");
                    }
                }
                tracing::warn!(file = %stored_name, error = %e, "upload rejected");
                return (e.status(), e.to_string()).into_response();
            }
        }

        let job = state.jobs.create(path, original_name);
        let queued = match state.queue.enqueue(job.id) {
            Ok(queued) => queued,
            Err(e) => {
                tracing::error!(job = job.id, error = %e, "failed to queue uploaded job");
                false
            }
        };

        let body = JobCreated {
            job_id: job.id,
            status: job.status,
            queued,
            status_url: format!("/api/jobs/{}/status", job.id),
            live_url: format!("/ws/jobs/{}", job.id),
        };
        return (StatusCode::CREATED, Json(body)).into_response();
    }

    (StatusCode::BAD_REQUEST, "missing `video` field").into_response()
}

/// Creates `{stamp}_{name}` in `dir`, adding a counter when that name is
/// taken. Never truncates an existing file.
async fn create_unique(
    dir: &FsPath,
    stamp: &str,
    name: &str,
) -> std::io::Result<(tokio::fs::File, PathBuf)> {
    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            format!("{stamp}_{name}")
        } else {
            format!("{stamp}_{attempt}_{name}")
        };
        let path = dir.join(candidate);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn save_field(
    mut field: Field<'_>,
    mut file: tokio::fs::File,
    limit: u64,
) -> Result<u64, UploadError> {
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await? {
        written += chunk.len() as u64;
        if written > limit {
            return Err(UploadError::TooLarge(limit));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

/// Keeps the last path component and a conservative character set.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.mp4".to_string()
    } else {
        cleaned.to_string()
    }
}

async fn list_jobs_handler(State(state): State<AppState>) -> impl IntoResponse {
    let jobs: Vec<JobListItem> = state
        .jobs
        .list_recent(RECENT_JOBS)
        .into_iter()
        .map(|job| JobListItem {
            id: job.id,
            video_url: job
                .video_path
                .file_name()
                .map(|name| format!("/media/{}", name.to_string_lossy())),
            original_name: job.original_name,
            status: job.status,
            progress: job.progress,
            detections_stored: state.detections.count(job.id),
            created_at: job.created_at,
            error_message: job.error_message,
        })
        .collect();
    Json(jobs)
}

async fn process_handler(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    let queued = match state.queue.submit(id) {
        Ok(queued) => queued,
        Err(e @ QueueError::NotFound(_)) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Err(e @ QueueError::NotQueueable { .. }) => {
            return (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e @ QueueError::Closed) => {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    };

    match state.jobs.status(id) {
        Ok(status) => {
            let code = if queued {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            (code, Json(SubmitResponse { job_id: id, queued, status })).into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn status_handler(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    match state.jobs.status(id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn results_handler(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    match state.jobs.get(id) {
        Some(job) => match job.results {
            Some(results) => Json(results).into_response(),
            None => (
                StatusCode::CONFLICT,
                format!("job {id} has no results while {:?}", job.status),
            )
                .into_response(),
        },
        None => (StatusCode::NOT_FOUND, "job not found").into_response(),
    }
}

async fn detections_handler(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    let Some(job) = state.jobs.get(id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    let fps = export_fps(job.fps, state.analysis.assumed_fps);

    let detections: Vec<ExportedDetection> = state
        .detections
        .for_job(id)
        .into_iter()
        .map(|record| ExportedDetection {
            frame_number: record.frame_number,
            timestamp: record.frame_number as f64 / fps,
            vehicle_type: record.vehicle_type,
            confidence: record.confidence,
            bbox: record.bbox,
            speed: record.speed.unwrap_or(0.0),
            recorded_at: record.recorded_at,
        })
        .collect();

    Json(detections).into_response()
}

/// Native fps when the container reported one, otherwise the configured assumption.
fn export_fps(native: f64, assumed: f64) -> f64 {
    if native > 0.0 {
        native
    } else {
        assumed
    }
}

async fn zones_handler(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    if state.jobs.get(id).is_none() {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    }
    Json(state.zones.ensure_default(id)).into_response()
}

async fn add_zone_handler(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(zone): Json<NewZone>,
) -> Response {
    if state.jobs.get(id).is_none() {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    }
    match state.zones.add(DetectionZone::new(id, zone.name, zone.points)) {
        Ok(()) => (StatusCode::CREATED, Json(state.zones.for_job(id))).into_response(),
        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
    }
}
