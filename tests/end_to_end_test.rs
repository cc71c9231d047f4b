//! End-to-end pipeline tests: delta discovery -> queue -> migration, and
//! the change-notification event path, driven through the crate's public
//! API with in-memory fakes standing in for S3/SQS/DynamoDB.
//!
//! The teacher spins up a live server process per test
//! (`tests/integration_test.rs::TestServer`); this crate is a batch CLI
//! with no listening surface to spawn, so these tests drive the same
//! `Migrator`/`JobSender`/`EventProcessor` seam the teacher drives through
//! HTTP, just in-process.

use async_trait::async_trait;
use md5::{Digest, Md5};
use s3_replicator::delta::DeltaFinder;
use s3_replicator::event::EventProcessor;
use s3_replicator::job_sender::JobSender;
use s3_replicator::migrator::Migrator;
use s3_replicator::queue::{Queue, QueueError, QueueMessage};
use s3_replicator::state_store::{StateStore, StateStoreError};
use s3_replicator::storage::{
    content_md5_base64, DownloadCapability, ListingPage, ObjectBody, PartsPage, StorageError,
    UploadCapability, UploadsPage,
};
use s3_replicator::types::{HeadMetadata, JobConfig, JobInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct FakeBucket {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeBucket {
    fn new() -> Self {
        Self { objects: Mutex::new(HashMap::new()) }
    }

    fn with(objects: &[(&str, &str)]) -> Self {
        let bucket = Self::new();
        for (key, body) in objects {
            bucket.objects.lock().unwrap().insert(key.to_string(), body.as_bytes().to_vec());
        }
        bucket
    }
}

#[async_trait]
impl DownloadCapability for FakeBucket {
    async fn list_objects(
        &self,
        prefix: &str,
        _include_version: bool,
        continuation_token: Option<String>,
    ) -> Result<ListingPage, StorageError> {
        if continuation_token.is_some() {
            return Ok(ListingPage::default());
        }
        let jobs = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| JobInfo::new(key.clone(), body.len() as u64))
            .collect();
        Ok(ListingPage { jobs, continuation_token: None })
    }

    async fn get_object(
        &self,
        key: &str,
        _size: u64,
        start: u64,
        chunk_size: u64,
        _version: Option<&str>,
    ) -> Result<ObjectBody, StorageError> {
        let objects = self.objects.lock().unwrap();
        let body = objects.get(key).ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let end = if chunk_size == 0 { body.len() as u64 } else { (start + chunk_size).min(body.len() as u64) };
        let data = bytes::Bytes::copy_from_slice(&body[start as usize..end as usize]);
        let md5: [u8; 16] = Md5::digest(&data).into();
        Ok(ObjectBody { data, md5 })
    }

    async fn head_object(&self, _key: &str) -> Result<HeadMetadata, StorageError> {
        Ok(HeadMetadata::default())
    }
}

#[async_trait]
impl UploadCapability for FakeBucket {
    async fn upload_object(
        &self,
        key: &str,
        body: bytes::Bytes,
        content_md5: &str,
        _storage_class: Option<&str>,
        _extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError> {
        let expected = content_md5_base64(&Md5::digest(&body).into());
        assert_eq!(content_md5, expected, "uploader sent the wrong content-md5");
        self.objects.lock().unwrap().insert(key.to_string(), body.to_vec());
        Ok(format!("\"{}\"", hex::encode(Md5::digest(&body))))
    }

    async fn create_multipart_upload(
        &self,
        _key: &str,
        _storage_class: Option<&str>,
        _extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError> {
        unimplemented!("end-to-end tests only exercise the small-file path")
    }
    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _part_number: i32,
        _body: bytes::Bytes,
        _body_md5: &str,
    ) -> Result<String, StorageError> {
        unimplemented!()
    }
    async fn complete_multipart_upload(&self, _key: &str, _upload_id: &str) -> Result<String, StorageError> {
        unimplemented!()
    }
    async fn list_parts(&self, _key: &str, _upload_id: &str, _token: Option<String>) -> Result<PartsPage, StorageError> {
        unimplemented!()
    }
    async fn list_multipart_uploads(
        &self,
        _prefix: &str,
        _key: Option<&str>,
        _token: Option<String>,
    ) -> Result<UploadsPage, StorageError> {
        Ok(UploadsPage { uploads: vec![], continuation_token: None })
    }
    async fn abort_multipart_upload(&self, _key: &str, _upload_id: &str) -> Result<(), StorageError> {
        Ok(())
    }
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

struct InMemoryQueue {
    messages: Mutex<Vec<serde_json::Value>>,
}

impl InMemoryQueue {
    fn new() -> Self {
        Self { messages: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn send_batch(&self, records: &[serde_json::Value]) -> Result<(), QueueError> {
        self.messages.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
    async fn receive(&self, max: i32) -> Result<Vec<QueueMessage>, QueueError> {
        let mut messages = self.messages.lock().unwrap();
        let take = (max as usize).min(messages.len());
        Ok(messages
            .drain(..take)
            .map(|body| QueueMessage { body, receipt_handle: "rh".to_string() })
            .collect())
    }
    async fn is_empty(&self) -> bool {
        self.messages.lock().unwrap().is_empty()
    }
    async fn delete_message(&self, _receipt_handle: &str) -> Result<(), QueueError> {
        Ok(())
    }
}

struct NoopStateStore;

#[async_trait]
impl StateStore for NoopStateStore {
    async fn log_job_start(
        &self,
        _src_bucket: &str,
        _src_prefix: &str,
        _des_bucket: &str,
        _des_prefix: &str,
        _job: &JobInfo,
        _extra_args: &HeadMetadata,
    ) -> Result<(), StateStoreError> {
        Ok(())
    }
    async fn log_job_end(
        &self,
        _src_bucket: &str,
        _key: &str,
        _etag: Option<String>,
        _err: &str,
    ) -> Result<(), StateStoreError> {
        Ok(())
    }
    async fn check_sequencer(&self, _key: &str, _new_sequencer: &str) -> Result<bool, StateStoreError> {
        Ok(true)
    }
}

/// Sequencer-tracking `StateStore` used by the event-path test, so a
/// replayed event with a lower hex sequencer is actually rejected.
struct SequencerStateStore {
    seen: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl StateStore for SequencerStateStore {
    async fn log_job_start(
        &self,
        _src_bucket: &str,
        _src_prefix: &str,
        _des_bucket: &str,
        _des_prefix: &str,
        _job: &JobInfo,
        _extra_args: &HeadMetadata,
    ) -> Result<(), StateStoreError> {
        Ok(())
    }
    async fn log_job_end(
        &self,
        _src_bucket: &str,
        _key: &str,
        _etag: Option<String>,
        _err: &str,
    ) -> Result<(), StateStoreError> {
        Ok(())
    }
    async fn check_sequencer(&self, key: &str, new_sequencer: &str) -> Result<bool, StateStoreError> {
        let mut seen = self.seen.lock().unwrap();
        let accept = match seen.get(key) {
            Some(existing) if existing.as_str() >= new_sequencer => false,
            _ => true,
        };
        if accept {
            seen.insert(key.to_string(), new_sequencer.to_string());
        }
        Ok(accept)
    }
}

/// Drives the whole batch path: `DeltaFinder` finds the missing key,
/// `JobSender` enqueues it, the worker loop receives it and `Migrator`
/// copies the bytes end to end.
#[tokio::test]
async fn delta_discovery_through_queue_to_migration() {
    let source = Arc::new(FakeBucket::with(&[("a", "hello"), ("b", "world")]));
    let destination = Arc::new(FakeBucket::with(&[("a", "hello")]));
    let queue = Arc::new(InMemoryQueue::new());

    let finder = DeltaFinder::new(source.clone(), destination.clone(), "", false);
    let sender = JobSender::new(finder, queue.clone());
    let enqueued = sender.run_if_queue_empty("").await.unwrap();
    assert_eq!(enqueued, 1);

    let messages = queue.receive(10).await.unwrap();
    assert_eq!(messages.len(), 1);

    let migrator = Migrator::new(
        source,
        destination.clone(),
        Arc::new(NoopStateStore),
        "src",
        "",
        "dst",
        "",
        JobConfig::default(),
    );

    let job: JobInfo = serde_json::from_value(messages[0].body.clone()).unwrap();
    assert_eq!(job.key, "b");
    migrator.run(&job).await.unwrap();

    assert_eq!(destination.objects.lock().unwrap().get("b").unwrap(), b"world");
}

/// A second discovery pass after the first object lands finds nothing left
/// to copy.
#[tokio::test]
async fn second_delta_pass_is_empty_once_converged() {
    let source = Arc::new(FakeBucket::with(&[("a", "hello")]));
    let destination = Arc::new(FakeBucket::with(&[("a", "hello")]));
    let finder = DeltaFinder::new(source, destination, "", false);
    let delta = finder.find_delta("").await.unwrap();
    assert!(delta.is_empty());
}

/// Change-notification batch: one `ObjectCreated` record is routed to the
/// migrator, one `ObjectRemoved` record is routed to deletion, and a
/// stale/replayed sequencer is dropped.
#[tokio::test]
async fn event_batch_splits_transfer_and_delete_and_drops_stale_events() {
    let source = Arc::new(FakeBucket::with(&[("new-file", "payload")]));
    let destination = Arc::new(FakeBucket::with(&[("old-file", "stale")]));
    let state_store: Arc<dyn StateStore> = Arc::new(SequencerStateStore { seen: Mutex::new(HashMap::new()) });

    let processor = EventProcessor::new(state_store.clone());
    let payload = serde_json::json!({
        "Records": [
            {
                "eventName": "ObjectCreated:Put",
                "s3": {"object": {"key": "new-file", "size": 7, "versionId": null, "sequencer": "0055AAAA"}}
            },
            {
                "eventName": "ObjectRemoved:Delete",
                "s3": {"object": {"key": "old-file", "size": null, "versionId": null, "sequencer": "0055AAAB"}}
            },
            {
                "eventName": "ObjectCreated:Put",
                "s3": {"object": {"key": "new-file", "size": 7, "versionId": null, "sequencer": "0011AAAA"}}
            },
        ]
    });

    let batch = processor.process(&payload).await.unwrap();
    assert_eq!(batch.transfer.len(), 1);
    assert_eq!(batch.transfer[0].key, "new-file");
    assert_eq!(batch.delete, vec!["old-file".to_string()]);

    let migrator = Migrator::new(
        source,
        destination.clone(),
        state_store,
        "src",
        "",
        "dst",
        "",
        JobConfig::default(),
    );
    for job in &batch.transfer {
        migrator.run(job).await.unwrap();
    }
    for key in &batch.delete {
        destination.delete_object(key).await.unwrap();
    }

    let objects = destination.objects.lock().unwrap();
    assert_eq!(objects.get("new-file").unwrap(), b"payload");
    assert!(!objects.contains_key("old-file"));
}
