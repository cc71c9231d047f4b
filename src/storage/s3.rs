//! S3-shaped storage backend, covering Amazon S3 as well as Tencent COS and
//! Qiniu Kodo (which speak the same API under a different endpoint).

use super::traits::{
    DownloadCapability, ListingPage, ObjectBody, PartSummary, PartsPage, StorageError,
    UploadCapability, UploadSummary, UploadsPage,
};
use crate::types::{Credentials, HeadMetadata, JobInfo, MAX_KEYS};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials as AwsCredentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use base64::Engine;
use md5::{Digest, Md5};
use tracing::{debug, instrument};

/// S3-API storage client. One instance is bound to a single bucket, as the
/// rest of the pipeline always operates within one source or destination
/// bucket at a time.
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Build a client for `source_type`'s endpoint formula (or the default
    /// AWS endpoint resolution for `SourceType::AmazonS3`).
    pub async fn new(
        bucket: impl Into<String>,
        region: &str,
        endpoint: Option<&str>,
        credentials: Option<&Credentials>,
        force_path_style: bool,
    ) -> Result<Self, StorageError> {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()));

        if let Some(ep) = endpoint {
            config_loader = config_loader.endpoint_url(ep);
        }

        match credentials {
            Some(creds) => {
                let aws_creds = AwsCredentials::new(
                    &creds.access_key_id,
                    &creds.secret_access_key,
                    None,
                    None,
                    "s3-migrator-config",
                );
                config_loader = config_loader.credentials_provider(aws_creds);
            }
            None => {
                config_loader = config_loader
                    .credentials_provider(aws_sdk_s3::config::Credentials::new(
                        "anonymous",
                        "anonymous",
                        None,
                        None,
                        "no_auth",
                    ));
            }
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(force_path_style)
            .build();
        let client = Client::from_conf(s3_config);
        let bucket = bucket.into();
        debug!("S3Client initialized for bucket {}", bucket);
        Ok(Self { client, bucket })
    }
}

fn is_archived(storage_class: Option<&aws_sdk_s3::types::ObjectStorageClass>) -> bool {
    matches!(
        storage_class,
        Some(aws_sdk_s3::types::ObjectStorageClass::Glacier)
            | Some(aws_sdk_s3::types::ObjectStorageClass::DeepArchive)
    )
}

#[async_trait]
impl DownloadCapability for S3Client {
    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        prefix: &str,
        include_version: bool,
        continuation_token: Option<String>,
    ) -> Result<ListingPage, StorageError> {
        if include_version {
            let mut request = self
                .client
                .list_object_versions()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(MAX_KEYS);
            if let Some(token) = continuation_token {
                request = request.key_marker(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StorageError::Backend(format!("list_object_versions: {e}")))?;

            let mut jobs = Vec::new();
            for v in response.versions.unwrap_or_default() {
                if !v.is_latest.unwrap_or(false) {
                    continue;
                }
                if is_archived(v.storage_class.as_ref()) {
                    continue;
                }
                if let Some(key) = v.key {
                    let mut job = JobInfo::new(key, v.size.unwrap_or(0) as u64);
                    if let Some(version_id) = v.version_id {
                        job = job.with_version(version_id);
                    }
                    jobs.push(job);
                }
            }

            let next = if response.is_truncated.unwrap_or(false) {
                response.next_key_marker
            } else {
                None
            };
            return Ok(ListingPage {
                jobs,
                continuation_token: next,
            });
        }

        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(MAX_KEYS);
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("list_objects_v2: {e}")))?;

        let mut jobs = Vec::new();
        for obj in response.contents.unwrap_or_default() {
            if is_archived(obj.storage_class.as_ref()) {
                continue;
            }
            if let Some(key) = obj.key {
                jobs.push(JobInfo::new(key, obj.size.unwrap_or(0) as u64));
            }
        }

        let next = if response.is_truncated.unwrap_or(false) {
            response.next_continuation_token
        } else {
            None
        };
        Ok(ListingPage {
            jobs,
            continuation_token: next,
        })
    }

    #[instrument(skip(self))]
    async fn get_object(
        &self,
        key: &str,
        size: u64,
        start: u64,
        chunk_size: u64,
        version: Option<&str>,
    ) -> Result<ObjectBody, StorageError> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(v) = version {
            request = request.version_id(v);
        }
        if chunk_size > 0 {
            let end = (start + chunk_size).min(size).saturating_sub(1);
            request = request.range(format!("bytes={start}-{end}"));
        }

        let response = request.send().await.map_err(|e| map_get_error(key, e))?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("reading body for {key}: {e}")))?
            .into_bytes();

        let md5: [u8; 16] = Md5::digest(&data).into();
        Ok(ObjectBody { data, md5 })
    }

    #[instrument(skip(self))]
    async fn head_object(&self, key: &str) -> Result<HeadMetadata, StorageError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_head_error(key, e))?;

        Ok(HeadMetadata {
            content_type: response.content_type,
            content_disposition: response.content_disposition,
            content_language: response.content_language,
            content_encoding: response.content_encoding,
            cache_control: response.cache_control,
            expires: response
                .expires
                .and_then(|e| chrono::DateTime::from_timestamp(e.secs(), 0)),
            website_redirect_location: response.website_redirect_location,
            user_metadata: response.metadata.unwrap_or_default(),
        })
    }
}

fn map_get_error(key: &str, e: SdkError<aws_sdk_s3::operation::get_object::GetObjectError>) -> StorageError {
    if let SdkError::ServiceError(service_error) = &e {
        if matches!(
            service_error.err(),
            aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)
        ) {
            return StorageError::NotFound(key.to_string());
        }
    }
    StorageError::Backend(format!("get_object {key}: {e}"))
}

fn map_head_error(
    key: &str,
    e: SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
) -> StorageError {
    if let SdkError::ServiceError(service_error) = &e {
        if matches!(
            service_error.err(),
            aws_sdk_s3::operation::head_object::HeadObjectError::NotFound(_)
        ) {
            return StorageError::NotFound(key.to_string());
        }
    }
    StorageError::Backend(format!("head_object {key}: {e}"))
}

fn apply_extra_metadata(
    mut builder: aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder,
    extra_metadata: &HeadMetadata,
) -> aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder {
    if let Some(ref v) = extra_metadata.content_type {
        builder = builder.content_type(v);
    }
    if let Some(ref v) = extra_metadata.content_disposition {
        builder = builder.content_disposition(v);
    }
    if let Some(ref v) = extra_metadata.content_language {
        builder = builder.content_language(v);
    }
    if let Some(ref v) = extra_metadata.content_encoding {
        builder = builder.content_encoding(v);
    }
    if let Some(ref v) = extra_metadata.cache_control {
        builder = builder.cache_control(v);
    }
    if let Some(ref v) = extra_metadata.website_redirect_location {
        builder = builder.website_redirect_location(v);
    }
    for (k, v) in &extra_metadata.user_metadata {
        builder = builder.metadata(k, v);
    }
    builder
}

#[async_trait]
impl UploadCapability for S3Client {
    #[instrument(skip(self, body, extra_metadata))]
    async fn upload_object(
        &self,
        key: &str,
        body: bytes::Bytes,
        content_md5: &str,
        storage_class: Option<&str>,
        extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError> {
        let mut builder = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(content_md5)
            .body(ByteStream::from(body));
        if let Some(sc) = storage_class {
            builder = builder.storage_class(sc.into());
        }
        builder = apply_extra_metadata(builder, extra_metadata);

        let response = builder
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("put_object {key}: {e}")))?;

        Ok(response
            .e_tag
            .unwrap_or_else(|| format!("\"{}\"", hex::encode(&[0u8; 16]))))
    }

    #[instrument(skip(self, extra_metadata))]
    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
        extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError> {
        let mut builder = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
        if let Some(sc) = storage_class {
            builder = builder.storage_class(sc.into());
        }
        if let Some(ref v) = extra_metadata.content_type {
            builder = builder.content_type(v);
        }
        for (k, v) in &extra_metadata.user_metadata {
            builder = builder.metadata(k, v);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("create_multipart_upload {key}: {e}")))?;

        response
            .upload_id
            .ok_or_else(|| StorageError::Backend("create_multipart_upload returned no upload id".into()))
    }

    #[instrument(skip(self, body))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
        body_md5: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(body_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("upload_part {key}#{part_number}: {e}")))?;

        response
            .e_tag
            .ok_or_else(|| StorageError::Backend("upload_part returned no ETag".into()))
    }

    #[instrument(skip(self))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<String, StorageError> {
        let mut parts: Vec<PartSummary> = Vec::new();
        let mut token = None;
        loop {
            let page = UploadCapability::list_parts(self, key, upload_id, token).await?;
            parts.extend(page.parts);
            token = page.continuation_token;
            if token.is_none() {
                break;
            }
        }
        parts.sort_by_key(|p| p.part_number);

        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag.clone())
                    .build()
            })
            .collect();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("complete_multipart_upload {key}: {e}")))?;

        response
            .e_tag
            .ok_or_else(|| StorageError::Backend("complete_multipart_upload returned no ETag".into()))
    }

    #[instrument(skip(self))]
    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        continuation_token: Option<String>,
    ) -> Result<PartsPage, StorageError> {
        let mut request = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id);
        if let Some(marker) = continuation_token {
            request = request.part_number_marker(marker);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("list_parts {key}: {e}")))?;

        let parts = response
            .parts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                Some(PartSummary {
                    part_number: p.part_number?,
                    etag: p.e_tag?,
                })
            })
            .collect();

        let next = if response.is_truncated.unwrap_or(false) {
            response.next_part_number_marker
        } else {
            None
        };
        Ok(PartsPage {
            parts,
            continuation_token: next,
        })
    }

    #[instrument(skip(self))]
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        key: Option<&str>,
        continuation_token: Option<String>,
    ) -> Result<UploadsPage, StorageError> {
        let mut request = self.client.list_multipart_uploads().bucket(&self.bucket).prefix(prefix);
        if let Some(marker) = continuation_token {
            request = request.key_marker(marker);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("list_multipart_uploads: {e}")))?;

        let uploads = response
            .uploads
            .unwrap_or_default()
            .into_iter()
            .filter(|u| match key {
                Some(k) => u.key.as_deref() == Some(k),
                None => true,
            })
            .filter_map(|u| {
                Some(UploadSummary {
                    key: u.key?,
                    upload_id: u.upload_id?,
                    initiated_at: u
                        .initiated
                        .and_then(|d| chrono::DateTime::from_timestamp(d.secs(), 0))
                        .unwrap_or_else(chrono::Utc::now),
                })
            })
            .collect();

        let next = if response.is_truncated.unwrap_or(false) {
            response.next_key_marker
        } else {
            None
        };
        Ok(UploadsPage {
            uploads,
            continuation_token: next,
        })
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("abort_multipart_upload {key}: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("delete_object {key}: {e}")))?;
        Ok(())
    }
}

/// Base64-encode a raw MD5 digest for use as `Content-MD5`.
pub fn content_md5_base64(digest: &[u8; 16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_md5_base64_matches_known_digest() {
        // MD5("helloworld")
        let digest = Md5::digest(b"helloworld");
        let encoded = content_md5_base64(&digest.into());
        assert_eq!(encoded, base64::engine::general_purpose::STANDARD.encode(digest));
    }
}
