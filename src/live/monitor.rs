use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::hub::{ProgressHub, PublishError};
use super::protocol::{ProgressUpdate, ServerMessage};
use crate::storage::{JobId, JobStore, StoreError};

#[derive(Debug, Error)]
enum MonitorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Republishes a job's progress once per `tick` until it reaches a
/// terminal status. Errors are logged and retried after `retry`.
pub async fn run_monitor(
    job_id: JobId,
    jobs: JobStore,
    hub: ProgressHub,
    tick: Duration,
    retry: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match publish_status(job_id, &jobs, &hub) {
            Ok(true) => {
                tracing::debug!(job = job_id, "job finished, status monitor stopping");
                break;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(job = job_id, error = %e, "status publish failed, retrying");
                tokio::time::sleep(retry).await;
                interval.reset();
            }
        }
    }
}

struct Running {
    viewers: usize,
    task: JoinHandle<()>,
}

/// One status monitor per watched job, shared by all of its viewers.
#[derive(Clone)]
pub struct MonitorRegistry {
    jobs: JobStore,
    hub: ProgressHub,
    tick: Duration,
    retry: Duration,
    running: Arc<Mutex<HashMap<JobId, Running>>>,
}

impl MonitorRegistry {
    pub fn new(jobs: JobStore, hub: ProgressHub, tick: Duration, retry: Duration) -> Self {
        Self {
            jobs,
            hub,
            tick,
            retry,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the job's monitor unless one is already running. The monitor
    /// is aborted when the last lease is dropped.
    pub fn watch(&self, job_id: JobId) -> MonitorLease {
        let mut running = self.running.lock();
        let entry = running.entry(job_id).or_insert_with(|| Running {
            viewers: 0,
            task: self.spawn(job_id),
        });
        // A monitor that already saw a terminal status has exited; a new
        // viewer still gets one snapshot.
        if entry.task.is_finished() {
            entry.task = self.spawn(job_id);
        }
        entry.viewers += 1;
        tracing::debug!(job = job_id, viewers = entry.viewers, "status monitor lease taken");

        MonitorLease {
            job_id,
            running: Arc::clone(&self.running),
        }
    }

    fn spawn(&self, job_id: JobId) -> JoinHandle<()> {
        tokio::spawn(run_monitor(
            job_id,
            self.jobs.clone(),
            self.hub.clone(),
            self.tick,
            self.retry,
        ))
    }

    #[cfg(test)]
    fn is_running(&self, job_id: JobId) -> bool {
        self.running
            .lock()
            .get(&job_id)
            .is_some_and(|r| !r.task.is_finished())
    }
}

pub struct MonitorLease {
    job_id: JobId,
    running: Arc<Mutex<HashMap<JobId, Running>>>,
}

impl Drop for MonitorLease {
    fn drop(&mut self) {
        let mut running = self.running.lock();
        let Some(entry) = running.get_mut(&self.job_id) else {
            return;
        };
        entry.viewers = entry.viewers.saturating_sub(1);
        if entry.viewers == 0 {
            entry.task.abort();
            running.remove(&self.job_id);
            tracing::debug!(job = self.job_id, "status monitor stopped, no viewers left");
        }
    }
}

/// Returns whether the published snapshot was terminal.
fn publish_status(job_id: JobId, jobs: &JobStore, hub: &ProgressHub) -> Result<bool, MonitorError> {
    let snapshot = jobs.status(job_id)?;
    hub.publish(
        job_id,
        ServerMessage::ProgressUpdate(ProgressUpdate::from_snapshot(job_id, &snapshot)),
    )?;
    Ok(snapshot.status.is_terminal())
}
