//! Aliyun OSS storage backend. OSS differs from the S3-shaped backends in
//! two ways this adapter has to account for: range reads clamp `end` to the
//! object size rather than erroring past it, and HEAD only reliably exposes
//! `ContentType`.

use super::traits::{
    DownloadCapability, ListingPage, ObjectBody, PartSummary, PartsPage, StorageError,
    UploadCapability, UploadSummary, UploadsPage,
};
use crate::types::{Credentials, HeadMetadata, JobInfo, MAX_KEYS};
use ali_oss_rs::multipart::{
    CompleteMultipartUploadRequest, CompleteMultipartUploadResult,
    InitiateMultipartUploadOptionsBuilder, ListMultipartUploadsOptionsBuilder,
    ListPartsOptionsBuilder, MultipartUploadsOperations, UploadPartRequest,
};
use ali_oss_rs::object::{
    GetObjectOptionsBuilder, HeadObjectOptions, ListObjectsOptionsBuilder, ObjectOperations,
    PutObjectOptionsBuilder,
};
use ali_oss_rs::Client;
use async_trait::async_trait;
use md5::{Digest, Md5};
use tracing::{debug, instrument};

/// OSS storage client, bound to a single bucket.
pub struct OssClient {
    client: Client,
    bucket: String,
}

impl OssClient {
    pub fn new(bucket: impl Into<String>, region: &str, credentials: &Credentials) -> Self {
        let client = Client::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            region,
        );
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn map_oss_err(context: &str, key: &str, e: ali_oss_rs::Error) -> StorageError {
    let message = e.to_string();
    if message.contains("NoSuchKey") || message.contains("404") {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Backend(format!("{context} {key}: {message}"))
    }
}

#[async_trait]
impl DownloadCapability for OssClient {
    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        prefix: &str,
        include_version: bool,
        continuation_token: Option<String>,
    ) -> Result<ListingPage, StorageError> {
        if include_version {
            return Err(StorageError::Backend(
                "Aliyun OSS adapter does not support versioned listings".to_string(),
            ));
        }

        let mut builder = ListObjectsOptionsBuilder::new().prefix(prefix).max_keys(MAX_KEYS as u32);
        if let Some(token) = continuation_token {
            builder = builder.continuation_token(token);
        }

        let response = self
            .client
            .list_objects(&self.bucket, Some(builder.build()))
            .await
            .map_err(|e| map_oss_err("list_objects", prefix, e))?;

        let jobs = response
            .contents
            .into_iter()
            .filter(|o| !matches!(o.storage_class.as_deref(), Some("Archive") | Some("ColdArchive")))
            .map(|o| JobInfo::new(o.key, o.size))
            .collect();

        Ok(ListingPage {
            jobs,
            continuation_token: if response.is_truncated {
                response.next_continuation_token
            } else {
                None
            },
        })
    }

    #[instrument(skip(self))]
    async fn get_object(
        &self,
        key: &str,
        size: u64,
        start: u64,
        chunk_size: u64,
        _version: Option<&str>,
    ) -> Result<ObjectBody, StorageError> {
        let mut builder = GetObjectOptionsBuilder::new();
        if chunk_size > 0 {
            // OSS clamps the end index to the object size rather than
            // rejecting an out-of-range request.
            let end = (start + chunk_size).min(size).saturating_sub(1);
            builder = builder.range(start, end);
        }

        let response = self
            .client
            .get_object(&self.bucket, key, Some(builder.build()))
            .await
            .map_err(|e| map_oss_err("get_object", key, e))?;

        let data = bytes::Bytes::from(response.data);
        let md5: [u8; 16] = Md5::digest(&data).into();
        Ok(ObjectBody { data, md5 })
    }

    #[instrument(skip(self))]
    async fn head_object(&self, key: &str) -> Result<HeadMetadata, StorageError> {
        let response = self
            .client
            .head_object(&self.bucket, key, None::<HeadObjectOptions>)
            .await
            .map_err(|e| map_oss_err("head_object", key, e))?;

        // OSS's HEAD response reliably exposes only Content-Type; the rest
        // of HeadMetadata is left unset for this backend.
        Ok(HeadMetadata {
            content_type: response.content_type,
            ..Default::default()
        })
    }
}

#[async_trait]
impl UploadCapability for OssClient {
    #[instrument(skip(self, body, extra_metadata))]
    async fn upload_object(
        &self,
        key: &str,
        body: bytes::Bytes,
        content_md5: &str,
        storage_class: Option<&str>,
        extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError> {
        let mut builder = PutObjectOptionsBuilder::new().content_md5(content_md5);
        if let Some(sc) = storage_class {
            builder = builder.storage_class(sc);
        }
        if let Some(ref ct) = extra_metadata.content_type {
            builder = builder.content_type(ct);
        }
        for (k, v) in &extra_metadata.user_metadata {
            builder = builder.metadata(k, v);
        }

        let response = self
            .client
            .put_object(&self.bucket, key, body.to_vec(), Some(builder.build()))
            .await
            .map_err(|e| map_oss_err("put_object", key, e))?;

        Ok(response.etag)
    }

    #[instrument(skip(self, extra_metadata))]
    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
        extra_metadata: &HeadMetadata,
    ) -> Result<String, StorageError> {
        let mut builder = InitiateMultipartUploadOptionsBuilder::new();
        if let Some(sc) = storage_class {
            builder = builder.storage_class(sc);
        }
        if let Some(ref ct) = extra_metadata.content_type {
            builder = builder.content_type(ct);
        }

        let response = self
            .client
            .initiate_multipart_uploads(&self.bucket, key, Some(builder.build()))
            .await
            .map_err(|e| map_oss_err("initiate_multipart_uploads", key, e))?;

        Ok(response.upload_id)
    }

    #[instrument(skip(self, body))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
        _body_md5: &str,
    ) -> Result<String, StorageError> {
        let params = UploadPartRequest {
            part_number: part_number as u32,
            upload_id: upload_id.to_string(),
        };

        let response = self
            .client
            .upload_part_from_buffer(&self.bucket, key, body.to_vec(), params)
            .await
            .map_err(|e| map_oss_err("upload_part", key, e))?;

        Ok(response.etag)
    }

    #[instrument(skip(self))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<String, StorageError> {
        let mut parts = Vec::new();
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

        let request = CompleteMultipartUploadRequest {
            upload_id: upload_id.to_string(),
            parts: parts
                .into_iter()
                .map(|p| (p.part_number as u32, p.etag))
                .collect(),
        };

        let response = self
            .client
            .complete_multipart_uploads(&self.bucket, key, request, None)
            .await
            .map_err(|e| map_oss_err("complete_multipart_uploads", key, e))?;

        debug!("completed multipart upload for {key}");
        // `None` options never requests a callback, so the server always
        // replies with `ApiResponse`; the `CallbackResponse` arm only exists
        // because the result type isn't specialized per call site.
        match response {
            CompleteMultipartUploadResult::ApiResponse(r) => Ok(r.etag),
            CompleteMultipartUploadResult::CallbackResponse(_) => Err(StorageError::Backend(
                "complete_multipart_uploads returned an unexpected callback response".to_string(),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        continuation_token: Option<String>,
    ) -> Result<PartsPage, StorageError> {
        let mut builder = ListPartsOptionsBuilder::new();
        if let Some(marker) = continuation_token {
            builder = builder.part_number_marker(marker);
        }

        let response = self
            .client
            .list_parts(&self.bucket, key, upload_id, Some(builder.build()))
            .await
            .map_err(|e| map_oss_err("list_parts", key, e))?;

        let parts = response
            .parts
            .into_iter()
            .map(|p| PartSummary {
                part_number: p.part_number as i32,
                etag: p.etag,
            })
            .collect();

        Ok(PartsPage {
            parts,
            continuation_token: if response.is_truncated {
                response.next_part_number_marker
            } else {
                None
            },
        })
    }

    #[instrument(skip(self))]
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        key: Option<&str>,
        continuation_token: Option<String>,
    ) -> Result<UploadsPage, StorageError> {
        let mut builder = ListMultipartUploadsOptionsBuilder::new().prefix(prefix);
        if let Some(marker) = continuation_token {
            builder = builder.key_marker(marker);
        }

        let response = self
            .client
            .list_multipart_uploads(&self.bucket, Some(builder.build()))
            .await
            .map_err(|e| map_oss_err("list_multipart_uploads", prefix, e))?;

        let uploads = response
            .uploads
            .into_iter()
            .filter(|u| match key {
                Some(k) => u.key == k,
                None => true,
            })
            .map(|u| UploadSummary {
                key: u.key,
                upload_id: u.upload_id,
                initiated_at: u.initiated,
            })
            .collect();

        Ok(UploadsPage {
            uploads,
            continuation_token: if response.is_truncated {
                response.next_key_marker
            } else {
                None
            },
        })
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_uploads(&self.bucket, key, upload_id)
            .await
            .map_err(|e| map_oss_err("abort_multipart_uploads", key, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object(&self.bucket, key)
            .await
            .map_err(|e| map_oss_err("delete_object", key, e))?;
        Ok(())
    }
}
