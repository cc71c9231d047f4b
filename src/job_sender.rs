//! Delta-driven queue population: waits for the queue to drain, then walks
//! the delta once and enqueues it in batches.
//!
//! Grounded on `migration_lib/job.py::_get_delta_and_send`, split apart
//! from `DeltaFinder` so the "when to run" policy (queue-empty gating)
//! stays separate from the "what to compute" logic (spec.md §4.2).

use crate::delta::DeltaFinder;
use crate::queue::Queue;
use crate::types::JobInfo;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum JobSenderError {
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    #[error("failed to serialize job record: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct JobSender {
    delta_finder: DeltaFinder,
    queue: Arc<dyn Queue>,
}

impl JobSender {
    pub fn new(delta_finder: DeltaFinder, queue: Arc<dyn Queue>) -> Self {
        Self { delta_finder, queue }
    }

    /// Drive one delta-discovery-and-enqueue pass, but only if the queue is
    /// currently empty — concurrent senders would otherwise duplicate work
    /// on top of an in-flight backlog.
    #[instrument(skip(self))]
    pub async fn run_if_queue_empty(&self, source_prefix: &str) -> Result<usize, JobSenderError> {
        if !self.queue.is_empty().await {
            info!("queue not empty, skipping delta discovery");
            return Ok(0);
        }

        let delta = self.delta_finder.find_delta(source_prefix).await?;
        if delta.is_empty() {
            return Ok(0);
        }

        self.send_all(&delta).await?;
        Ok(delta.len())
    }

    async fn send_all(&self, jobs: &[JobInfo]) -> Result<(), JobSenderError> {
        let records = jobs
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        // `Queue::send_batch` already chunks internally at QUEUE_BATCH_SIZE,
        // but we chunk here too so one oversized page doesn't build a single
        // giant `Vec` of serialized records before any network call happens.
        for chunk in records.chunks(crate::types::QUEUE_BATCH_SIZE) {
            if let Err(e) = self.queue.send_batch(chunk).await {
                warn!("failed to send a batch of {} delta records: {e}", chunk.len());
                return Err(e.into());
            }
        }

        info!("enqueued {} delta records", jobs.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DownloadCapability, ListingPage, ObjectBody, StorageError};
    use crate::types::HeadMetadata;
    use crate::queue::{QueueError, QueueMessage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedListing(Vec<JobInfo>);

    #[async_trait]
    impl DownloadCapability for FixedListing {
        async fn list_objects(
            &self,
            _prefix: &str,
            _include_version: bool,
            continuation_token: Option<String>,
        ) -> Result<ListingPage, StorageError> {
            if continuation_token.is_some() {
                return Ok(ListingPage::default());
            }
            Ok(ListingPage {
                jobs: self.0.clone(),
                continuation_token: None,
            })
        }
        async fn get_object(
            &self,
            _key: &str,
            _size: u64,
            _start: u64,
            _chunk_size: u64,
            _version: Option<&str>,
        ) -> Result<ObjectBody, StorageError> {
            unimplemented!()
        }
        async fn head_object(&self, _key: &str) -> Result<HeadMetadata, StorageError> {
            unimplemented!()
        }
    }

    struct FakeQueue {
        empty: bool,
        sent: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Queue for FakeQueue {
        async fn send_batch(&self, records: &[serde_json::Value]) -> Result<(), QueueError> {
            self.sent.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
        async fn receive(&self, _max: i32) -> Result<Vec<QueueMessage>, QueueError> {
            unimplemented!()
        }
        async fn is_empty(&self) -> bool {
            self.empty
        }
        async fn delete_message(&self, _receipt_handle: &str) -> Result<(), QueueError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn skips_delta_discovery_when_queue_not_empty() {
        let source = Arc::new(FixedListing(vec![JobInfo::new("a", 1)]));
        let destination = Arc::new(FixedListing(vec![]));
        let finder = DeltaFinder::new(source, destination, "", false);
        let queue = Arc::new(FakeQueue {
            empty: false,
            sent: Mutex::new(Vec::new()),
        });

        let sender = JobSender::new(finder, queue.clone());
        let sent = sender.run_if_queue_empty("").await.unwrap();
        assert_eq!(sent, 0);
        assert!(queue.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueues_the_full_delta_when_queue_is_empty() {
        let source = Arc::new(FixedListing(vec![
            JobInfo::new("a", 1),
            JobInfo::new("b", 2),
            JobInfo::new("c", 3),
        ]));
        let destination = Arc::new(FixedListing(vec![JobInfo::new("a", 1)]));
        let finder = DeltaFinder::new(source, destination, "", false);
        let queue = Arc::new(FakeQueue {
            empty: true,
            sent: Mutex::new(Vec::new()),
        });

        let sender = JobSender::new(finder, queue.clone());
        let sent = sender.run_if_queue_empty("").await.unwrap();
        assert_eq!(sent, 2);
        assert_eq!(queue.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_delta_sends_nothing() {
        let source = Arc::new(FixedListing(vec![JobInfo::new("a", 1)]));
        let destination = Arc::new(FixedListing(vec![JobInfo::new("a", 1)]));
        let finder = DeltaFinder::new(source, destination, "", false);
        let queue = Arc::new(FakeQueue {
            empty: true,
            sent: Mutex::new(Vec::new()),
        });

        let sender = JobSender::new(finder, queue.clone());
        let sent = sender.run_if_queue_empty("").await.unwrap();
        assert_eq!(sent, 0);
    }
}
