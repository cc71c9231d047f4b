//! Process-level configuration: environment inputs read once at startup
//! and the per-worker `JobConfig` derived from them.
//!
//! Grounded on `config.rs::Config::from_env`'s pattern of reading one
//! environment variable per field with a typed default; spec.md §6 lists
//! the recognized variables and their defaults.

use crate::types::{
    Credentials, JobConfig, SourceType, CHUNK_SIZE, JOB_TIMEOUT_SECS, MAX_RETRIES, MAX_THREADS,
    MULTIPART_THRESHOLD,
};
use serde::Deserialize;

/// Which side of the transfer this process holds credentials for.
/// `GET` reads from source with credentials, writes to destination
/// anonymously (or vice versa for `PUT`) — see spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Get,
    Put,
}

impl std::str::FromStr for JobType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(JobType::Get),
            "PUT" => Ok(JobType::Put),
            other => Err(ConfigError::InvalidValue {
                var: "JOB_TYPE",
                value: other.to_string(),
            }),
        }
    }
}

/// Process-wide configuration, read from environment at startup and
/// handed down to the `JobSender`/worker loop. Mirrors spec.md §6's
/// environment inputs table.
#[derive(Debug, Clone)]
pub struct Config {
    pub job_table_name: String,
    pub event_table_name: String,
    pub sqs_queue_name: String,
    pub src_bucket_name: String,
    pub src_bucket_prefix: String,
    pub des_bucket_name: String,
    pub des_bucket_prefix: String,
    pub job_type: JobType,
    pub source_type: SourceType,
    pub region_name: String,
    pub ssm_parameter_credentials: Option<String>,
    pub storage_class: Option<String>,
    pub job: JobConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    /// Read every recognized environment variable, applying the defaults
    /// from spec.md §6. Required variables (bucket names, queue/table
    /// names, region) are errors when absent; tunables fall back silently.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source_type_raw = env_var("SOURCE_TYPE")?;
        let source_type = match source_type_raw.as_str() {
            "Amazon_S3" => SourceType::AmazonS3,
            "Aliyun_OSS" => SourceType::AliyunOss,
            "Tencent_COS" => SourceType::TencentCos,
            "Qiniu_Kodo" => SourceType::QiniuKodo,
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "SOURCE_TYPE",
                    value: other.to_string(),
                })
            }
        };

        let job_type_raw = env_var("JOB_TYPE")?;
        let job_type: JobType = job_type_raw.parse()?;

        let multipart_threshold_mib: u64 = env_or("MULTIPART_THRESHOLD", MULTIPART_THRESHOLD / (1024 * 1024));
        let chunk_size_mib: u64 = env_or("CHUNK_SIZE", CHUNK_SIZE / (1024 * 1024));

        Ok(Self {
            job_table_name: std::env::var("TABLE_QUEUE_NAME")
                .or_else(|_| std::env::var("JOB_TABLE_NAME"))
                .map_err(|_| ConfigError::Missing("JOB_TABLE_NAME"))?,
            event_table_name: env_var("EVENT_TABLE_NAME")?,
            sqs_queue_name: env_var("SQS_QUEUE_NAME")?,
            src_bucket_name: env_var("SRC_BUCKET_NAME")?,
            src_bucket_prefix: std::env::var("SRC_BUCKET_PREFIX").unwrap_or_default(),
            des_bucket_name: env_var("DEST_BUCKET_NAME")?,
            des_bucket_prefix: std::env::var("DEST_BUCKET_PREFIX").unwrap_or_default(),
            job_type,
            source_type,
            region_name: env_var("REGION_NAME")?,
            ssm_parameter_credentials: std::env::var("SSM_PARAMETER_CREDENTIALS").ok(),
            storage_class: std::env::var("STORAGE_CLASS").ok(),
            job: JobConfig {
                include_version: env_bool("INCLUDE_VERSION", false),
                include_metadata: env_bool("INCLUDE_METADATA", false),
                clean_unfinished_upload: env_bool("CLEAN_UNFINISHED_UPLOAD", false),
                verify_md5_twice: env_bool("VERIFY_MD5_TWICE", false),
                max_threads: env_or("MAX_THREADS", MAX_THREADS),
                max_retries: env_or("MAX_RETRY", MAX_RETRIES),
                multipart_threshold: multipart_threshold_mib * 1024 * 1024,
                chunk_size: chunk_size_mib * 1024 * 1024,
                job_timeout: env_or("JOB_TIMEOUT", JOB_TIMEOUT_SECS),
            },
        })
    }
}

/// Credentials as returned by the external parameter-store lookup
/// (`SSM_PARAMETER_CREDENTIALS`). The store itself is an external
/// collaborator (spec.md §1); this only shapes its JSON response.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub region_name: Option<String>,
}

impl StoredCredentials {
    pub fn into_credentials(self, fallback_region: &str) -> Credentials {
        Credentials::new(
            self.access_key_id,
            self.secret_access_key,
            Some(self.region_name.unwrap_or_else(|| fallback_region.to_string())),
        )
    }
}
