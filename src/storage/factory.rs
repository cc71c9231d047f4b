//! Selects and constructs the right storage adapter for a `SourceType`,
//! mirroring `config::BackendConfig`'s tagged-enum dispatch in the teacher.

use super::{OssClient, S3Client};
use crate::storage::{DownloadCapability, StorageError, UploadCapability};
use crate::types::{Credentials, SourceType};
use std::sync::Arc;

/// A constructed pair of capabilities for one bucket. Most callers only
/// need one side (source: download, destination: upload), but a bucket can
/// legitimately serve as both in tests against a single backend.
pub struct ClientPair {
    pub download: Arc<dyn DownloadCapability>,
    pub upload: Arc<dyn UploadCapability>,
}

/// Builds storage clients for a `SourceType`, computing the backend's
/// endpoint URL from its region per spec's formulas.
pub struct ClientFactory;

impl ClientFactory {
    /// Construct a client pair. `no_auth` requests anonymous access, which
    /// the S3-shaped backend supports via an anonymous credentials
    /// provider; Aliyun OSS has no anonymous mode and rejects it (Open
    /// Question 1 in DESIGN.md does not cover this — this is a
    /// factory-level input-validation rule stated directly in spec.md
    /// §4.1's "Backend variants").
    pub async fn build(
        source_type: SourceType,
        bucket: impl Into<String>,
        region: &str,
        credentials: Option<&Credentials>,
        no_auth: bool,
        force_path_style: bool,
    ) -> Result<ClientPair, StorageError> {
        let bucket = bucket.into();

        match source_type {
            SourceType::AliyunOss => {
                if no_auth {
                    return Err(StorageError::Backend(
                        "no_auth is not supported for the Aliyun OSS backend".to_string(),
                    ));
                }
                let credentials = credentials.ok_or_else(|| {
                    StorageError::Backend("Aliyun OSS requires credentials".to_string())
                })?;
                let client = Arc::new(OssClient::new(bucket, region, credentials));
                Ok(ClientPair {
                    download: client.clone(),
                    upload: client,
                })
            }
            SourceType::AmazonS3 | SourceType::TencentCos | SourceType::QiniuKodo => {
                let endpoint = source_type.endpoint_for_region(region);
                let client = Arc::new(
                    S3Client::new(
                        bucket,
                        region,
                        endpoint.as_deref(),
                        if no_auth { None } else { credentials },
                        force_path_style,
                    )
                    .await?,
                );
                Ok(ClientPair {
                    download: client.clone(),
                    upload: client,
                })
            }
        }
    }
}
