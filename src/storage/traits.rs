//! Storage backend trait definitions: `DownloadCapability` and
//! `UploadCapability`, the two capability sets every object-store adapter
//! implements.

use crate::types::{HeadMetadata, JobInfo};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access to {0} forbidden")]
    Forbidden(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("upload {0} not found")]
    NoSuchUpload(String),

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("request timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Permanent, non-retriable source errors map to the part worker's
    /// `Quit` outcome (spec.md §7 "Permanent source").
    pub fn is_permanent(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::Forbidden(_))
    }
}

/// One page of a paginated object listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub jobs: Vec<JobInfo>,
    pub continuation_token: Option<String>,
}

/// One page of a paginated `list_parts` response.
#[derive(Debug, Clone, Default)]
pub struct PartsPage {
    pub parts: Vec<PartSummary>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSummary {
    pub part_number: i32,
    pub etag: String,
}

/// One page of a paginated `list_multipart_uploads` response.
#[derive(Debug, Clone, Default)]
pub struct UploadsPage {
    pub uploads: Vec<UploadSummary>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
    pub initiated_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a ranged or full-object read: the body and an MD5 digest of
/// exactly those bytes.
pub struct ObjectBody {
    pub data: bytes::Bytes,
    pub md5: [u8; 16],
}

/// Read-side capability: listing, range reads, and HEAD metadata.
///
/// Object-safe so adapters can be stored as `Arc<dyn DownloadCapability>`.
#[async_trait]
pub trait DownloadCapability: Send + Sync {
    /// Lazily list objects under `prefix`, filtering out `GLACIER` and
    /// `DEEP_ARCHIVE` storage classes. With `include_version`, yields only
    /// the latest non-delete-marker version of each key.
    async fn list_objects(
        &self,
        prefix: &str,
        include_version: bool,
        continuation_token: Option<String>,
    ) -> Result<ListingPage, StorageError>;

    /// Read `[start, start+chunk_size)` of `key`, clamped to `size`; reads
    /// the whole object when `chunk_size == 0`.
    async fn get_object(
        &self,
        key: &str,
        size: u64,
        start: u64,
        chunk_size: u64,
        version: Option<&str>,
    ) -> Result<ObjectBody, StorageError>;

    /// HEAD metadata. Attributes unsupported by this backend are left
    /// `None` on the returned `HeadMetadata`.
    async fn head_object(&self, key: &str) -> Result<HeadMetadata, StorageError>;

    /// Convenience wrapper returning a lazy stream of listing pages.
    fn list_objects_stream<'a>(
        &'a self,
        prefix: &'a str,
        include_version: bool,
    ) -> BoxStream<'a, Result<ListingPage, StorageError>> {
        Box::pin(futures::stream::unfold(
            (self, Some(None::<String>)),
            move |(this, token)| async move {
                let token = token?;
                match this.list_objects(prefix, include_version, token).await {
                    Ok(page) => {
                        let next = page.continuation_token.clone().map(Some);
                        Some((Ok(page), (this, next)))
                    }
                    Err(e) => Some((Err(e), (this, None))),
                }
            },
        ))
    }
}

/// Write-side capability: single-shot put and the full multipart protocol.
#[async_trait]
pub trait UploadCapability: Send + Sync {
    /// Single-shot put with server-side MD5 check. `content_md5` is base64
    /// of the raw MD5 digest.
    async fn upload_object(
        &self,
        key: &str,
        body: bytes::Bytes,
        content_md5: &str,
        storage_class: Option<&str>,
        extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError>;

    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
        extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError>;

    /// Upload one part; server-side MD5 verification via `body_md5`.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
        body_md5: &str,
    ) -> Result<String, StorageError>;

    /// Re-lists the parts from the server and composes them in ascending
    /// `part_number` order.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<String, StorageError>;

    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        continuation_token: Option<String>,
    ) -> Result<PartsPage, StorageError>;

    /// Lists in-progress multipart uploads under `prefix`; filtered to
    /// `key` when given.
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        key: Option<&str>,
        continuation_token: Option<String>,
    ) -> Result<UploadsPage, StorageError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_are_quit_triggers() {
        assert!(StorageError::NotFound("k".into()).is_permanent());
        assert!(StorageError::Forbidden("k".into()).is_permanent());
        assert!(!StorageError::Timeout.is_permanent());
        assert!(!StorageError::Backend("x".into()).is_permanent());
    }
}
