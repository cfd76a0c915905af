use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

use super::protocol::ServerMessage;
use crate::storage::JobId;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no subscribers for job {0}")]
    NoSubscribers(JobId),
}

/// Per-job broadcast topics. Topics are created on first subscribe and
/// dropped once a publish finds nobody listening.
#[derive(Clone, Default)]
pub struct ProgressHub {
    topics: Arc<RwLock<HashMap<JobId, broadcast::Sender<ServerMessage>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<ServerMessage> {
        let mut topics = self.topics.write();
        topics
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, job_id: JobId, message: ServerMessage) -> Result<usize, PublishError> {
        let sent = match self.topics.read().get(&job_id) {
            Some(sender) => sender.send(message).ok(),
            None => return Err(PublishError::NoSubscribers(job_id)),
        };

        match sent {
            Some(receivers) => Ok(receivers),
            None => {
                let mut topics = self.topics.write();
                if topics
                    .get(&job_id)
                    .is_some_and(|sender| sender.receiver_count() == 0)
                {
                    topics.remove(&job_id);
                }
                Err(PublishError::NoSubscribers(job_id))
            }
        }
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.topics
            .read()
            .get(&job_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_that_job_only() {
        let hub = ProgressHub::new();
        let mut first = hub.subscribe(1);
        let mut second = hub.subscribe(1);
        let mut other = hub.subscribe(2);

        let delivered = hub.publish(1, ServerMessage::status("hello")).unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(first.recv().await.unwrap(), ServerMessage::status("hello"));
        assert_eq!(second.recv().await.unwrap(), ServerMessage::status("hello"));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_reported() {
        let hub = ProgressHub::new();
        let err = hub.publish(9, ServerMessage::status("x")).unwrap_err();
        assert!(matches!(err, PublishError::NoSubscribers(9)));
    }

    #[test]
    fn test_topic_dropped_after_last_subscriber_leaves() {
        let hub = ProgressHub::new();
        let rx = hub.subscribe(3);
        assert_eq!(hub.subscriber_count(3), 1);
        drop(rx);

        assert!(hub.publish(3, ServerMessage::status("gone")).is_err());
        assert_eq!(hub.subscriber_count(3), 0);

        let _rx = hub.subscribe(3);
        assert_eq!(hub.publish(3, ServerMessage::status("back")).unwrap(), 1);
    }
}
