use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::server::AppState;
use crate::live::{
    ClientCommand, ControlError, LivePlayer, PlaybackOptions, ServerMessage, SessionControl,
};
use crate::storage::{JobId, JobStore};

const OUTGOING_BUFFER: usize = 8;

pub async fn job_socket(
    ws: WebSocketUpgrade,
    Path(id): Path<JobId>,
    State(state): State<AppState>,
) -> Response {
    let Some(job) = state.jobs.get(id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    ws.on_upgrade(move |socket| run_session(socket, job.id, job.video_path, state))
}

async fn run_session(socket: WebSocket, job_id: JobId, video_path: PathBuf, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut updates = state.hub.subscribe(job_id);
    let monitor = state.monitors.watch(job_id);
    let control = Arc::new(SessionControl::new());
    let (out_tx, mut out_rx) = mpsc::channel(OUTGOING_BUFFER);
    tracing::info!(
        job = job_id,
        viewers = state.hub.subscriber_count(job_id),
        "live session connected"
    );
    let player = spawn_player(&state, job_id, video_path, Arc::clone(&control), out_tx);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_command(&state.jobs, job_id, &control, text.as_str()) {
                        if send(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(job = job_id, error = %e, "live socket read failed");
                    break;
                }
            },
            Some(outgoing) = out_rx.recv() => {
                if send(&mut sink, &outgoing).await.is_err() {
                    break;
                }
            }
            update = updates.recv() => match update {
                Ok(message) => {
                    if send(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job = job_id, skipped, "live session lagged behind progress");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    // Teardown never propagates; every failure is only logged.
    control.stop();
    drop(monitor);
    drop(updates);
    drop(out_rx);
    if let Err(e) = player.await {
        tracing::warn!(job = job_id, error = %e, "live playback task failed");
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(job = job_id, error = %e, "live socket close failed");
    }

    tracing::info!(job = job_id, "live session disconnected");
}

fn spawn_player(
    state: &AppState,
    job_id: JobId,
    video_path: PathBuf,
    control: Arc<SessionControl>,
    outgoing: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    let opener = Arc::clone(&state.opener);
    let detector = state.detector.clone();
    let analysis = Arc::clone(&state.analysis);

    tokio::task::spawn_blocking(move || {
        let source = match opener.open(&video_path) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(job = job_id, error = %e, "live source unavailable");
                let _ = outgoing.blocking_send(ServerMessage::error(e.to_string()));
                return;
            }
        };

        let options = PlaybackOptions {
            assumed_fps: analysis.assumed_fps,
            preview: analysis.live_preview,
            speed_limit: analysis.speed_limit,
        };
        let player = LivePlayer::new(job_id, source, detector, Arc::clone(&control), outgoing, options);
        if control.start().is_err() {
            return;
        }
        player.run(analysis.live_frame_interval());
    })
}

/// Reply for one client text message, if any.
fn handle_command(
    jobs: &JobStore,
    job_id: JobId,
    control: &SessionControl,
    text: &str,
) -> Option<ServerMessage> {
    let command = match ClientCommand::parse(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(job = job_id, error = %e, "malformed control message");
            return Some(ServerMessage::error(e.to_string()));
        }
    };

    match control.apply(command) {
        Ok(Some(ack)) => {
            tracing::debug!(job = job_id, ?command, state = ?control.state(), "control command applied");
            Some(ServerMessage::status(ack))
        }
        Ok(None) => Some(match jobs.status(job_id) {
            Ok(status) => ServerMessage::StatusUpdate { status },
            Err(e) => ServerMessage::error(e.to_string()),
        }),
        Err(ControlError::Stopped) => {
            tracing::debug!(job = job_id, ?command, "command ignored on stopped session");
            None
        }
    }
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode live message");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}
