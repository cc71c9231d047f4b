//! Per-object migration orchestrator: small-file vs. multipart path,
//! upload resume, and state-store bookkeeping.
//!
//! Grounded on `migration_lib/job.py::JobMigrator`.

use crate::multipart::split;
use crate::part_pool::{PartPoolJob, PartTransferPool, PoolError};
use crate::state_store::StateStore;
use crate::storage::{content_md5_base64, DownloadCapability, StorageError, UploadCapability};
use crate::types::{HeadMetadata, JobConfig, JobInfo};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("part transfer pool failed: {0}")]
    Pool(#[from] PoolError),

    #[error("include_version with the multipart path is unsupported (see DESIGN.md Open Question 1)")]
    UnsupportedConfig,

    #[error("uploaded object checksum mismatch: expected {expected}, destination reports {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

pub struct Migrator {
    source: Arc<dyn DownloadCapability>,
    destination: Arc<dyn UploadCapability>,
    state_store: Arc<dyn StateStore>,
    src_bucket: String,
    src_prefix: String,
    des_bucket: String,
    des_prefix: String,
    config: JobConfig,
}

impl Migrator {
    pub fn new(
        source: Arc<dyn DownloadCapability>,
        destination: Arc<dyn UploadCapability>,
        state_store: Arc<dyn StateStore>,
        src_bucket: impl Into<String>,
        src_prefix: impl Into<String>,
        des_bucket: impl Into<String>,
        des_prefix: impl Into<String>,
        config: JobConfig,
    ) -> Self {
        Self {
            source,
            destination,
            state_store,
            src_bucket: src_bucket.into(),
            src_prefix: src_prefix.into(),
            des_bucket: des_bucket.into(),
            des_prefix: des_prefix.into(),
            config,
        }
    }

    /// Run one object's migration to completion. Errors are reported
    /// through the state store (`log_job_end`'s `err` field), not
    /// propagated further — per spec.md §7, the caller (worker loop) only
    /// needs to know whether to ack or let the queue redeliver the message,
    /// which it decides independently of this result.
    #[instrument(skip(self, job), fields(key = %job.key))]
    pub async fn run(&self, job: &JobInfo) -> Result<String, MigrationError> {
        if self.config.include_version && self.config.multipart_threshold < job.size {
            return Err(MigrationError::UnsupportedConfig);
        }

        let extra_args = if self.config.include_metadata {
            self.source.head_object(&job.key).await?
        } else {
            HeadMetadata::default()
        };

        if let Err(e) = self
            .state_store
            .log_job_start(&self.src_bucket, &self.src_prefix, &self.des_bucket, &self.des_prefix, job, &extra_args)
            .await
        {
            // State-store failures on log_job_start are logged, not fatal
            // (spec.md §7) — the transfer proceeds regardless.
            warn!("log_job_start failed for {}: {e}", job.key);
        }

        let des_key = format!("{}{}", self.des_prefix, job.key);
        let result = if job.size <= self.config.multipart_threshold {
            self.run_small_file(job, &des_key, &extra_args).await
        } else {
            self.run_multipart(job, &des_key, &extra_args).await
        };

        let (etag, err) = match &result {
            Ok(etag) => (Some(etag.clone()), String::new()),
            Err(e) => (None, e.to_string()),
        };
        if let Err(e) = self.state_store.log_job_end(&self.src_bucket, &job.key, etag, &err).await {
            warn!("log_job_end failed for {}: {e}", job.key);
        }

        result
    }

    async fn run_small_file(
        &self,
        job: &JobInfo,
        des_key: &str,
        extra_args: &HeadMetadata,
    ) -> Result<String, MigrationError> {
        let version = if self.config.include_version && job.version != "null" {
            Some(job.version.as_str())
        } else {
            None
        };
        let body = self.source.get_object(&job.key, job.size, 0, 0, version).await?;
        let content_md5 = content_md5_base64(&body.md5);

        let etag = self
            .destination
            .upload_object(des_key, body.data, &content_md5, job.storage_class.as_deref(), extra_args)
            .await?;

        info!("uploaded {} ({} bytes) via small-file path", job.key, job.size);
        Ok(etag)
    }

    async fn run_multipart(
        &self,
        job: &JobInfo,
        des_key: &str,
        extra_args: &HeadMetadata,
    ) -> Result<String, MigrationError> {
        let (indices, chunk_size) = split(job.size, self.config.chunk_size);

        let (upload_id, dryrun_etags) = self.resume_or_create(des_key, job.storage_class.as_deref(), extra_args).await?;

        let plan: Vec<(i32, u64)> = indices
            .iter()
            .enumerate()
            .map(|(i, &start)| ((i + 1) as i32, start))
            .collect();

        let pool = PartTransferPool::new(
            self.source.clone(),
            self.destination.clone(),
            self.config.max_threads,
            self.config.max_retries,
            Duration::from_secs(self.config.job_timeout),
            self.config.verify_md5_twice,
            self.config.include_version,
        );
        let pool_job = PartPoolJob {
            src_key: job.key.clone(),
            des_key: des_key.to_string(),
            size: job.size,
            version: if self.config.include_version && job.version != "null" {
                Some(job.version.clone())
            } else {
                None
            },
        };

        let etag = match pool.run(&pool_job, &upload_id, chunk_size, &plan, &dryrun_etags, CancellationToken::new()).await {
            Ok(etag) => etag,
            Err(e) => {
                // Timeout leaves the upload in place for a later resume
                // (spec.md §7); any other failure aborts it outright.
                if !matches!(e, PoolError::Timeout) {
                    if let Err(abort_err) = self.destination.abort_multipart_upload(des_key, &upload_id).await {
                        warn!("failed to abort multipart upload {upload_id} for {des_key}: {abort_err}");
                    }
                }
                return Err(e.into());
            }
        };

        match self.destination.complete_multipart_upload(des_key, &upload_id).await {
            Ok(final_etag) => {
                if self.config.verify_md5_twice && final_etag != etag {
                    return Err(MigrationError::ChecksumMismatch { expected: etag, actual: final_etag });
                }
                Ok(final_etag)
            }
            Err(e) => {
                if let Err(abort_err) = self.destination.abort_multipart_upload(des_key, &upload_id).await {
                    warn!("failed to abort multipart upload {upload_id} for {des_key} after complete failure: {abort_err}");
                }
                Err(e.into())
            }
        }
    }

    /// Inspect any in-progress multipart uploads for `des_key`. With
    /// `clean_unfinished_upload`, abort them all and start fresh;
    /// otherwise reuse the first one found, treating its listed parts as
    /// already-uploaded ("dryrun") entries.
    async fn resume_or_create(
        &self,
        des_key: &str,
        storage_class: Option<&str>,
        extra_args: &HeadMetadata,
    ) -> Result<(String, HashMap<i32, String>), MigrationError> {
        let mut uploads = Vec::new();
        let mut token = None;
        loop {
            let page = self.destination.list_multipart_uploads(des_key, Some(des_key), token).await?;
            uploads.extend(page.uploads);
            token = page.continuation_token;
            if token.is_none() {
                break;
            }
        }

        if uploads.is_empty() {
            let upload_id = self.destination.create_multipart_upload(des_key, storage_class, extra_args).await?;
            return Ok((upload_id, HashMap::new()));
        }

        if self.config.clean_unfinished_upload {
            for upload in &uploads {
                if let Err(e) = self.destination.abort_multipart_upload(des_key, &upload.upload_id).await {
                    warn!("failed to abort stale upload {} for {des_key}: {e}", upload.upload_id);
                }
            }
            let upload_id = self.destination.create_multipart_upload(des_key, storage_class, extra_args).await?;
            return Ok((upload_id, HashMap::new()));
        }

        let upload = &uploads[0];
        let mut dryrun = HashMap::new();
        let mut token = None;
        loop {
            let page = self.destination.list_parts(des_key, &upload.upload_id, token).await?;
            for part in page.parts {
                dryrun.insert(part.part_number, part.etag);
            }
            token = page.continuation_token;
            if token.is_none() {
                break;
            }
        }
        Ok((upload.upload_id.clone(), dryrun))
    }

}
