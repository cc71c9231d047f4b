//! Change-notification batch processing.
//!
//! Grounded on spec.md §4.4 and the queue's three accepted payload shapes
//! (§4.3): a direct job record, a `{Records: [...]}` change-notification
//! batch, or a `{"Event":"s3:TestEvent"}` ping. `EventProcessor` only
//! handles the batch shape; `queue`'s message dispatch handles the other
//! two.

use crate::state_store::{StateStore, StateStoreError};
use crate::types::JobInfo;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unrecognized change-notification payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

/// One `Records[]` entry of an S3-shaped change-notification batch.
#[derive(Debug, Deserialize)]
struct ChangeRecord {
    #[serde(rename = "eventName")]
    event_name: String,
    s3: ChangeRecordS3,
}

#[derive(Debug, Deserialize)]
struct ChangeRecordS3 {
    object: ChangeRecordObject,
}

#[derive(Debug, Deserialize)]
struct ChangeRecordObject {
    key: String,
    size: Option<u64>,
    #[serde(rename = "versionId")]
    version_id: Option<String>,
    sequencer: String,
}

#[derive(Debug, Deserialize)]
struct ChangeNotificationBatch {
    #[serde(rename = "Records")]
    records: Vec<ChangeRecord>,
}

/// Result of processing one change-notification batch: objects to
/// transfer and keys to delete, already filtered by the per-key sequencer.
#[derive(Debug, Default, Clone)]
pub struct ProcessedBatch {
    pub transfer: Vec<JobInfo>,
    pub delete: Vec<String>,
}

pub struct EventProcessor {
    state_store: Arc<dyn StateStore>,
}

impl EventProcessor {
    pub fn new(state_store: Arc<dyn StateStore>) -> Self {
        Self { state_store }
    }

    /// Parse and filter one change-notification batch. An unrecognized
    /// payload shape fails the whole batch (spec.md §4.4's "unknown payload
    /// shape causes the whole batch to fail visibly") so the queue
    /// redelivers it.
    #[instrument(skip(self, payload))]
    pub async fn process(&self, payload: &serde_json::Value) -> Result<ProcessedBatch, EventError> {
        let batch: ChangeNotificationBatch = serde_json::from_value(payload.clone())
            .map_err(|e| EventError::InvalidPayload(e.to_string()))?;

        let mut out = ProcessedBatch::default();
        for record in batch.records {
            let key = url_decode(&record.s3.object.key);

            let accepted = self
                .state_store
                .check_sequencer(&key, &record.s3.object.sequencer)
                .await?;
            if !accepted {
                debug!("discarding stale/duplicate event for {key}");
                continue;
            }

            if record.event_name.contains("ObjectRemoved") {
                out.delete.push(key);
            } else {
                let mut job = JobInfo::new(key, record.s3.object.size.unwrap_or(0));
                if let Some(version) = record.s3.object.version_id {
                    job = job.with_version(version);
                }
                out.transfer.push(job);
            }
        }
        Ok(out)
    }
}

/// URL-decode a change-notification key, treating `+` as space per S3's
/// (non-standard) encoding of object-change notification keys.
fn url_decode(raw: &str) -> String {
    let with_spaces = raw.replace('+', " ");
    urlencoding::decode(&with_spaces)
        .map(|s| s.into_owned())
        .unwrap_or_else(|e| {
            warn!("failed to URL-decode key {raw:?}: {e}");
            with_spaces
        })
}
