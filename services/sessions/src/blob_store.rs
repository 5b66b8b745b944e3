use crate::config::BlobStoreConfig;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors returned by blob store backends
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob {0} not found")]
    NotFound(Uuid),

    #[error("Blob storage error: {0}")]
    Backend(String),
}

impl BlobError {
    fn backend(context: &str, err: impl fmt::Display) -> Self {
        BlobError::Backend(format!("{context}: {err}"))
    }
}

/// Metadata written alongside a blob
#[derive(Debug, Clone, PartialEq)]
pub struct BlobMetadata {
    /// Original file name, returned unchanged on read
    pub filename: Option<String>,
    /// MIME type of the payload
    pub content_type: String,
    /// Session the payload was uploaded for
    pub session_id: Uuid,
    /// Upload time
    pub uploaded_at: DateTime<Utc>,
}

/// Byte stream of a stored blob
pub type BlobStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// A blob opened for reading
pub struct BlobObject {
    pub id: Uuid,
    pub content_type: String,
    pub filename: Option<String>,
    /// Payload length in bytes, when the backend reports it
    pub size: Option<u64>,
    pub body: BlobStream,
}

impl fmt::Debug for BlobObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobObject")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl BlobObject {
    /// Drain the body into memory
    pub async fn into_bytes(self) -> Result<Bytes, BlobError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

/// Storage for opaque binary payloads addressed by generated ids.
///
/// Blobs are immutable: `put` always writes under a fresh id and nothing is
/// updated in place.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a payload, returning its new id
    async fn put(&self, data: Bytes, metadata: BlobMetadata) -> Result<Uuid, BlobError>;

    /// Open a blob for streaming
    async fn get(&self, id: Uuid) -> Result<BlobObject, BlobError>;

    /// Remove a blob
    async fn delete(&self, id: Uuid) -> Result<(), BlobError>;

    /// Connectivity probe for health checks
    async fn ping(&self) -> Result<(), BlobError>;
}

/// Object metadata keys
const META_FILENAME: &str = "filename";
const META_SESSION_ID: &str = "session-id";
const META_UPLOADED_AT: &str = "uploaded-at";

/// S3-compatible blob store for uploaded videos
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: BlobStoreConfig,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &BlobStoreConfig) -> Result<Self> {
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build();

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(timeouts)
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Object key for a blob id: `{prefix}/{blob_id}`
    pub fn object_key(&self, id: Uuid) -> String {
        object_key(&self.config.key_prefix, id)
    }

    /// Simple single-part upload for small payloads
    async fn simple_upload(
        &self,
        key: &str,
        data: Bytes,
        metadata: &BlobMetadata,
    ) -> Result<(), BlobError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(&metadata.content_type)
            .metadata(META_SESSION_ID, metadata.session_id.to_string())
            .metadata(META_UPLOADED_AT, metadata.uploaded_at.to_rfc3339());

        if let Some(ref filename) = metadata.filename {
            request = request.metadata(META_FILENAME, encode_filename(filename));
        }

        request
            .send()
            .await
            .map_err(|e| BlobError::backend("Failed to upload blob to S3", e))?;

        Ok(())
    }

    /// Multipart upload for large payloads
    async fn multipart_upload(
        &self,
        key: &str,
        data: Bytes,
        metadata: &BlobMetadata,
    ) -> Result<(), BlobError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&metadata.content_type)
            .metadata(META_SESSION_ID, metadata.session_id.to_string())
            .metadata(META_UPLOADED_AT, metadata.uploaded_at.to_rfc3339());

        if let Some(ref filename) = metadata.filename {
            request = request.metadata(META_FILENAME, encode_filename(filename));
        }

        let create_response = request
            .send()
            .await
            .map_err(|e| BlobError::backend("Failed to create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| BlobError::Backend("No upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, data).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| BlobError::backend("Failed to complete multipart upload", e))?;

                Ok(())
            }
            Err(e) => {
                // Drop the uploaded parts so they are not billed forever
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(error = %abort_err, key = %key, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: Bytes,
    ) -> Result<Vec<CompletedPart>, BlobError> {
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < data.len() {
            let end = (offset + part_size).min(data.len());
            let body = ByteStream::from(data.slice(offset..end));

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| BlobError::backend("Failed to upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }

    /// Check whether an object exists
    async fn exists(&self, id: Uuid) -> Result<bool, BlobError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(BlobError::backend("Failed to check blob existence", e))
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data, metadata), fields(session_id = %metadata.session_id, size_bytes = data.len()))]
    async fn put(&self, data: Bytes, metadata: BlobMetadata) -> Result<Uuid, BlobError> {
        let id = Uuid::new_v4();
        let key = self.object_key(id);
        let size = data.len();

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, data, &metadata).await?;
        } else {
            self.simple_upload(&key, data, &metadata).await?;
        }

        info!(blob_id = %id, key = %key, size_bytes = size, "Blob uploaded");

        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<BlobObject, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    BlobError::NotFound(id)
                } else {
                    BlobError::backend("Failed to fetch blob from S3", e)
                }
            })?;

        let content_type = output
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = output
            .metadata()
            .and_then(|m| m.get(META_FILENAME))
            .and_then(|encoded| decode_filename(encoded));
        let size = output
            .content_length()
            .and_then(|len| u64::try_from(len).ok());

        let body = ReaderStream::new(output.body.into_async_read())
            .map_err(|e| BlobError::backend("Failed to read blob body", e))
            .boxed();

        Ok(BlobObject {
            id,
            content_type,
            filename,
            size,
            body,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), BlobError> {
        // S3 deletes are idempotent, so absence has to be checked explicitly
        if !self.exists(id).await? {
            return Err(BlobError::NotFound(id));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
            .map_err(|e| BlobError::backend("Failed to delete blob from S3", e))?;

        debug!(blob_id = %id, "Blob deleted from S3");
        Ok(())
    }

    async fn ping(&self) -> Result<(), BlobError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| BlobError::backend("Bucket unreachable", e))?;
        Ok(())
    }
}

fn object_key(prefix: &str, id: Uuid) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}/{id}")
    }
}

/// S3 user metadata travels as HTTP headers, which only carry ASCII
fn encode_filename(filename: &str) -> String {
    STANDARD.encode(filename.as_bytes())
}

fn decode_filename(encoded: &str) -> Option<String> {
    STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Replace characters that are unsafe in file names and header values
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | '"' | '\r' | '\n' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Get file extension for a video content type
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type.to_lowercase().as_str() {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-msvideo" => "avi",
        _ => "bin",
    }
}
