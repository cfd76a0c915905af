use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::analytics::{AnalysisError, JobProcessor};
use crate::storage::{JobId, JobStatus};

const PANIC_MESSAGE: &str = "internal error while processing video";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {status:?} and cannot be queued")]
    NotQueueable { id: JobId, status: JobStatus },
    #[error("worker is shutting down")]
    Closed,
}

/// Producer side of the job queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<JobId>,
    active: Arc<Mutex<HashSet<JobId>>>,
    closed: Arc<AtomicBool>,
    processor: Arc<JobProcessor>,
}

impl JobQueue {
    /// Appends a job. Returns `false` when it is already queued or running.
    pub fn enqueue(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut active = self.active.lock();
        self.push(&mut active, job_id)
    }

    /// Queues a pending job, or resets and re-queues a failed one.
    pub fn submit(&self, job_id: JobId) -> Result<bool, QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        let mut active = self.active.lock();
        if active.contains(&job_id) {
            return Ok(false);
        }

        let status = self
            .processor
            .jobs()
            .get(job_id)
            .map(|job| job.status)
            .ok_or(QueueError::NotFound(job_id))?;
        match status {
            JobStatus::Pending => {}
            JobStatus::Failed => self
                .processor
                .reset_for_retry(job_id)
                .map_err(|_| QueueError::NotFound(job_id))?,
            status => return Err(QueueError::NotQueueable { id: job_id, status }),
        }

        self.push(&mut active, job_id)
    }

    #[cfg(test)]
    pub fn is_active(&self, job_id: JobId) -> bool {
        self.active.lock().contains(&job_id)
    }

    fn push(&self, active: &mut HashSet<JobId>, job_id: JobId) -> Result<bool, QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        if !active.insert(job_id) {
            return Ok(false);
        }
        if self.sender.send(job_id).is_err() {
            active.remove(&job_id);
            return Err(QueueError::Closed);
        }
        tracing::debug!(job = job_id, "job queued");
        Ok(true)
    }
}

/// Handle to the background worker thread.
pub struct Worker {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Worker {
    /// Refuses new jobs, lets the current one drain for up to `timeout`,
    /// then cancels it.
    pub async fn stop(mut self, timeout: Duration) {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.store(true, Ordering::Relaxed);

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(result) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "worker task failed");
                }
            }
            Err(_) => {
                tracing::warn!(?timeout, "worker did not drain in time, cancelling current job");
                self.cancel.store(true, Ordering::Relaxed);
                if let Err(e) = self.handle.await {
                    tracing::error!(error = %e, "worker task failed");
                }
            }
        }
        tracing::info!("worker stopped");
    }
}

pub fn spawn_worker(processor: Arc<JobProcessor>, poll: Duration) -> (JobQueue, Worker) {
    let (sender, receiver) = mpsc::channel();
    let active = Arc::new(Mutex::new(HashSet::new()));
    let shutdown = Arc::new(AtomicBool::new(false));
    let cancel = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));

    let queue = JobQueue {
        sender,
        active: Arc::clone(&active),
        closed: Arc::clone(&closed),
        processor: Arc::clone(&processor),
    };

    let handle = {
        let shutdown = Arc::clone(&shutdown);
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || {
            run_worker(processor, receiver, active, shutdown, cancel, poll)
        })
    };

    (
        queue,
        Worker {
            handle,
            shutdown,
            cancel,
            closed,
        },
    )
}

fn run_worker(
    processor: Arc<JobProcessor>,
    receiver: mpsc::Receiver<JobId>,
    active: Arc<Mutex<HashSet<JobId>>>,
    shutdown: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    poll: Duration,
) {
    tracing::info!("analysis worker started");

    while !shutdown.load(Ordering::Relaxed) {
        let job_id = match receiver.recv_timeout(poll) {
            Ok(id) => id,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(job_id, &cancel)));
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(AnalysisError::Cancelled(_))) => {
                processor.fail(job_id, "interrupted by server shutdown");
            }
            Ok(Err(e)) => processor.fail(job_id, &e.to_string()),
            Err(_) => processor.fail(job_id, PANIC_MESSAGE),
        }

        active.lock().remove(&job_id);
    }

    // Anything still queued stays pending.
    let mut active = active.lock();
    while let Ok(job_id) = receiver.try_recv() {
        active.remove(&job_id);
        tracing::info!(job = job_id, "queued job left pending at shutdown");
    }

    tracing::info!("analysis worker stopped");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use super::*;
    use crate::analytics::testing::{FakeOpener, ScriptedDetector};
    use crate::analytics::{
        shared, BoundingBox, Detector, DetectionParams, DetectorError, Frame, VehicleDetection,
        VehicleDetector, VehicleType,
    };
    use crate::config::DetectorConfig;
    use crate::live::ProgressHub;
    use crate::storage::{DetectionStore, JobStore, ZoneStore};

    const POLL: Duration = Duration::from_millis(10);

    struct Setup {
        jobs: JobStore,
        detections: DetectionStore,
        opener: FakeOpener,
        processor: Arc<JobProcessor>,
    }

    fn setup(detector: impl Detector + 'static) -> Setup {
        let jobs = JobStore::new();
        let detections = DetectionStore::new();
        let opener = FakeOpener::new();
        let processor = Arc::new(JobProcessor::new(
            jobs.clone(),
            detections.clone(),
            ZoneStore::new(),
            ProgressHub::new(),
            Arc::new(opener.clone()),
            VehicleDetector::new(shared(detector), &DetectorConfig::default()),
            60.0,
        ));
        Setup {
            jobs,
            detections,
            opener,
            processor,
        }
    }

    fn car() -> VehicleDetection {
        VehicleDetection::new(VehicleType::Car, 0.9, BoundingBox::new(0.0, 0.0, 8.0, 8.0))
    }

    async fn wait_for(jobs: &JobStore, id: JobId, done: impl Fn(JobStatus) -> bool) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = jobs.get(id).map(|j| j.status).unwrap_or(JobStatus::Pending);
            if done(status) || Instant::now() > deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_run_in_order() {
        let s = setup(ScriptedDetector::new(vec![car()]));
        s.opener.add_clip("a.mp4", 3, 30.0);
        s.opener.add_clip("b.mp4", 2, 30.0);
        let a = s.jobs.create(PathBuf::from("a.mp4"), "a.mp4".into());
        let b = s.jobs.create(PathBuf::from("b.mp4"), "b.mp4".into());

        let (queue, worker) = spawn_worker(Arc::clone(&s.processor), POLL);
        assert!(queue.submit(a.id).unwrap());
        assert!(queue.submit(b.id).unwrap());

        assert_eq!(wait_for(&s.jobs, b.id, JobStatus::is_terminal).await, JobStatus::Completed);
        let a_done = s.jobs.get(a.id).unwrap();
        let b_started = s.jobs.get(b.id).unwrap().started_at.unwrap();
        assert_eq!(a_done.status, JobStatus::Completed);
        assert!(a_done.completed_at.unwrap() <= b_started);
        assert!(!queue.is_active(a.id));

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_job_waits_for_active_one() {
        let s = setup(ScriptedDetector::new(vec![car()]).with_delay(Duration::from_millis(20)));
        s.opener.add_clip("slow.mp4", 10, 30.0);
        s.opener.add_clip("next.mp4", 1, 30.0);
        let slow = s.jobs.create(PathBuf::from("slow.mp4"), "slow.mp4".into());
        let next = s.jobs.create(PathBuf::from("next.mp4"), "next.mp4".into());

        let (queue, worker) = spawn_worker(Arc::clone(&s.processor), POLL);
        queue.submit(slow.id).unwrap();
        wait_for(&s.jobs, slow.id, |st| st == JobStatus::Processing).await;
        queue.submit(next.id).unwrap();

        assert_eq!(s.jobs.get(next.id).unwrap().status, JobStatus::Pending);
        assert!(queue.is_active(next.id));

        wait_for(&s.jobs, next.id, JobStatus::is_terminal).await;
        let slow_done = s.jobs.get(slow.id).unwrap();
        let next_started = s.jobs.get(next.id).unwrap().started_at.unwrap();
        assert_eq!(slow_done.status, JobStatus::Completed);
        assert!(slow_done.completed_at.unwrap() <= next_started);

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_enqueue_is_noop() {
        let s = setup(ScriptedDetector::new(vec![car()]).with_delay(Duration::from_millis(20)));
        s.opener.add_clip("a.mp4", 5, 30.0);
        let a = s.jobs.create(PathBuf::from("a.mp4"), "a.mp4".into());

        let (queue, worker) = spawn_worker(Arc::clone(&s.processor), POLL);
        assert!(queue.enqueue(a.id).unwrap());
        assert!(!queue.enqueue(a.id).unwrap());
        assert!(!queue.submit(a.id).unwrap());

        wait_for(&s.jobs, a.id, JobStatus::is_terminal).await;
        assert_eq!(s.detections.count(a.id), 5);
        assert!(matches!(
            queue.submit(a.id),
            Err(QueueError::NotQueueable { status: JobStatus::Completed, .. })
        ));

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_does_not_stop_worker_and_retry_resets() {
        let s = setup(ScriptedDetector::new(vec![car()]));
        s.opener.add_clip("good.mp4", 2, 30.0);
        let missing = s.jobs.create(PathBuf::from("late.mp4"), "late.mp4".into());
        let good = s.jobs.create(PathBuf::from("good.mp4"), "good.mp4".into());

        let (queue, worker) = spawn_worker(Arc::clone(&s.processor), POLL);
        queue.submit(missing.id).unwrap();
        queue.submit(good.id).unwrap();

        assert_eq!(wait_for(&s.jobs, missing.id, JobStatus::is_terminal).await, JobStatus::Failed);
        assert_eq!(wait_for(&s.jobs, good.id, JobStatus::is_terminal).await, JobStatus::Completed);
        let failed = s.jobs.get(missing.id).unwrap();
        assert!(failed
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("Processing failed: ")));

        s.opener.add_clip("late.mp4", 2, 30.0);
        assert!(queue.submit(missing.id).unwrap());
        assert_eq!(wait_for(&s.jobs, missing.id, JobStatus::is_terminal).await, JobStatus::Completed);
        let retried = s.jobs.get(missing.id).unwrap();
        assert_eq!(retried.error_message, None);
        assert_eq!(retried.frames_processed, 2);

        worker.stop(Duration::from_secs(1)).await;
    }

    struct PanickingDetector;

    impl Detector for PanickingDetector {
        fn detect(
            &mut self,
            _frame: &Frame,
            _params: &DetectionParams,
        ) -> Result<Vec<VehicleDetection>, DetectorError> {
            panic!("index out of bounds");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_becomes_generic_failure() {
        let s = setup(PanickingDetector);
        s.opener.add_clip("a.mp4", 1, 30.0);
        let a = s.jobs.create(PathBuf::from("a.mp4"), "a.mp4".into());

        let (queue, worker) = spawn_worker(Arc::clone(&s.processor), POLL);
        queue.submit(a.id).unwrap();

        assert_eq!(wait_for(&s.jobs, a.id, JobStatus::is_terminal).await, JobStatus::Failed);
        assert_eq!(
            s.jobs.get(a.id).unwrap().error_message.as_deref(),
            Some("Processing failed: internal error while processing video")
        );
        assert!(!queue.is_active(a.id));

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_long_job() {
        let s = setup(ScriptedDetector::new(vec![car()]).with_delay(Duration::from_millis(20)));
        s.opener.add_clip("long.mp4", 1000, 30.0);
        let long = s.jobs.create(PathBuf::from("long.mp4"), "long.mp4".into());

        let (queue, worker) = spawn_worker(Arc::clone(&s.processor), POLL);
        queue.submit(long.id).unwrap();
        wait_for(&s.jobs, long.id, |st| st == JobStatus::Processing).await;

        worker.stop(Duration::from_millis(50)).await;

        let job = s.jobs.get(long.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("interrupted"));
        assert_eq!(s.detections.count(long.id), 0);
        assert!(matches!(queue.submit(long.id), Err(QueueError::Closed)));
    }
}
