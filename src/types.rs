//! Core data model: job records, per-worker configuration, and state-store
//! schemas shared across the storage, delta, queue, and migration layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default per-request attempt budget for a single part transfer.
pub const MAX_RETRIES: u32 = 5;
/// Default bound on concurrent part workers per object.
pub const MAX_THREADS: usize = 10;
/// Default page size for listing operations.
pub const MAX_KEYS: i32 = 1000;
/// Byte size above which the multipart path is used, by default.
pub const MULTIPART_THRESHOLD: u64 = 50 * 1024 * 1024;
/// Default target bytes per part.
pub const CHUNK_SIZE: u64 = 10 * 1024 * 1024;
/// Maximum records per `send_batch` call.
pub const QUEUE_BATCH_SIZE: usize = 10;
/// Upstream protocol's hard cap on multipart part count.
pub const MAX_PARTS: usize = 10_000;
/// Default wall-clock budget for one object's part transfers.
pub const JOB_TIMEOUT_SECS: u64 = 870;

/// Which object-storage API a bucket speaks. The S3-shaped variants differ
/// only in endpoint URL; Aliyun OSS has its own range and HEAD semantics
/// (see `storage::oss`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "Amazon_S3")]
    AmazonS3,
    #[serde(rename = "Aliyun_OSS")]
    AliyunOss,
    #[serde(rename = "Tencent_COS")]
    TencentCos,
    #[serde(rename = "Qiniu_Kodo")]
    QiniuKodo,
}

impl SourceType {
    /// Compute the backend's endpoint URL for a region, or `None` when the
    /// default (Amazon S3's own endpoint resolution) applies.
    pub fn endpoint_for_region(&self, region: &str) -> Option<String> {
        match self {
            SourceType::AmazonS3 => None,
            SourceType::AliyunOss => Some(format!("https://oss-{region}.aliyuncs.com")),
            SourceType::TencentCos => Some(format!("https://cos.{region}.myqcloud.com")),
            SourceType::QiniuKodo => Some(format!("https://s3-{region}.qiniucs.com")),
        }
    }
}

/// Normalized credential record. Replaces the duck-typed, renamed-per-backend
/// dict the original passed around; adapters consume it directly.
#[derive(Clone, Serialize, Deserialize, zeroize::ZeroizeOnDrop)]
pub struct Credentials {
    #[zeroize(skip)]
    pub access_key_id: String,
    pub secret_access_key: String,
    #[zeroize(skip)]
    pub region_name: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("region_name", &self.region_name)
            .finish()
    }
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region_name: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region_name,
        }
    }
}

/// One object to transfer, as produced by `DeltaFinder` or `EventProcessor`
/// and consumed by `Migrator`. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub key: String,
    pub size: u64,
    /// `"null"` when versioning is not in play.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub storage_class: Option<String>,
}

fn default_version() -> String {
    "null".to_string()
}

impl JobInfo {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            version: default_version(),
            storage_class: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }
}

/// Per-worker tunables. Mirrors `config.py::JobConfig`; loaded from
/// environment by `crate::config::Config::from_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub include_version: bool,
    pub include_metadata: bool,
    pub clean_unfinished_upload: bool,
    pub verify_md5_twice: bool,
    pub max_threads: usize,
    pub max_retries: u32,
    pub multipart_threshold: u64,
    pub chunk_size: u64,
    pub job_timeout: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            include_version: false,
            include_metadata: false,
            clean_unfinished_upload: false,
            verify_md5_twice: false,
            max_threads: MAX_THREADS,
            max_retries: MAX_RETRIES,
            multipart_threshold: MULTIPART_THRESHOLD,
            chunk_size: CHUNK_SIZE,
            job_timeout: JOB_TIMEOUT_SECS,
        }
    }
}

/// Status of a migration attempt, as recorded in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Started,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ERROR")]
    Error,
}

/// Durable per-object migration record, keyed by `bucket/key` in the state
/// store. Created at job start, updated in place at job end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    pub des_bucket: String,
    pub des_key: String,
    #[serde(default)]
    pub extra_info: HashMap<String, String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_spent_time: Option<f64>,
    pub job_status: JobStatus,
    pub try_time: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl MigrationRecord {
    /// Start a fresh record for one transfer attempt.
    pub fn start(
        job: &JobInfo,
        des_bucket: impl Into<String>,
        des_key: impl Into<String>,
        extra_info: HashMap<String, String>,
    ) -> Self {
        Self {
            size: job.size,
            storage_class: job.storage_class.clone(),
            des_bucket: des_bucket.into(),
            des_key: des_key.into(),
            extra_info,
            start_time: Utc::now(),
            end_time: None,
            total_spent_time: None,
            job_status: JobStatus::Started,
            try_time: 1,
            version_id: if job.version == "null" {
                None
            } else {
                Some(job.version.clone())
            },
            etag: None,
            err: String::new(),
        }
    }

    /// Finalize the record with the outcome of one attempt.
    pub fn finish(&mut self, etag: Option<String>, err: impl Into<String>) {
        let end_time = Utc::now();
        let err = err.into();
        self.total_spent_time =
            Some((end_time - self.start_time).num_milliseconds() as f64 / 1000.0);
        self.end_time = Some(end_time);
        self.etag = etag;
        self.job_status = if err.is_empty() {
            JobStatus::Done
        } else {
            JobStatus::Error
        };
        self.err = err;
    }
}

/// Event-sequencer record: one row per object key, tracking the highest
/// accepted change-notification sequencer for that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSequencerRecord {
    pub object_key: String,
    pub sequencer: String,
}

/// HEAD metadata attributes recognized across backends. Fields a backend
/// doesn't support are left `None` rather than defaulted, so adapters can
/// tell "absent on the object" from "not supported by this backend".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeadMetadata {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub website_redirect_location: Option<String>,
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_info_defaults_version_to_null() {
        let job = JobInfo::new("a.txt", 10);
        assert_eq!(job.version, "null");
    }

    #[test]
    fn job_info_deserializes_without_version_field() {
        let job: JobInfo = serde_json::from_str(r#"{"key":"a.txt","size":10}"#).unwrap();
        assert_eq!(job.version, "null");
    }

    #[test]
    fn migration_record_finish_sets_done_on_empty_err() {
        let job = JobInfo::new("a.txt", 10);
        let mut rec = MigrationRecord::start(&job, "dest", "a.txt", HashMap::new());
        rec.finish(Some("\"abc\"".to_string()), "");
        assert_eq!(rec.job_status, JobStatus::Done);
        assert!(rec.start_time <= rec.end_time.unwrap());
    }

    #[test]
    fn migration_record_finish_sets_error_on_nonempty_err() {
        let job = JobInfo::new("a.txt", 10);
        let mut rec = MigrationRecord::start(&job, "dest", "a.txt", HashMap::new());
        rec.finish(None, "boom");
        assert_eq!(rec.job_status, JobStatus::Error);
        assert_eq!(rec.err, "boom");
    }

    #[test]
    fn source_type_endpoint_formulas() {
        assert_eq!(
            SourceType::AliyunOss.endpoint_for_region("cn-hangzhou"),
            Some("https://oss-cn-hangzhou.aliyuncs.com".to_string())
        );
        assert_eq!(
            SourceType::TencentCos.endpoint_for_region("ap-guangzhou"),
            Some("https://cos.ap-guangzhou.myqcloud.com".to_string())
        );
        assert_eq!(
            SourceType::QiniuKodo.endpoint_for_region("z0"),
            Some("https://s3-z0.qiniucs.com".to_string())
        );
        assert_eq!(SourceType::AmazonS3.endpoint_for_region("us-east-1"), None);
    }
}
