use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::{Bytes, BytesMut};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StorageSettings;
use crate::errors::{AppError, Result};

/// S3 requires every part except the last to be at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Consumes a live byte stream and turns it into a retrievable artifact.
///
/// The byte source may be slow and large; implementations must transfer it
/// incrementally. A closed source is only normal end-of-stream when the
/// cancel token has not fired; a token fired at any point before completion
/// resolves the call to an error and no artifact may be committed. On
/// success the returned reference is a time-limited download URL, not a
/// permanent public link. Retry after failure is the caller's concern.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(
        &self,
        key: &str,
        body: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Multipart uploader against any S3-compatible endpoint with path-style
/// addressing and static credentials.
pub struct S3Uploader {
    client: s3::Client,
    bucket: String,
    key_prefix: Option<String>,
    url_ttl: Duration,
}

impl S3Uploader {
    pub async fn connect(storage: &StorageSettings) -> Result<Self> {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&storage.endpoint_url)
            .region(Region::new(storage.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &storage.access_key_id,
                &storage.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket_name.clone(),
            key_prefix: storage.key_prefix.clone(),
            url_ttl: Duration::from_secs(storage.url_ttl_secs),
        })
    }

    fn object_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    async fn send_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        part: Bytes,
    ) -> Result<CompletedPart> {
        debug!(key, part_number, bytes = part.len(), "uploading part");
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(part))
            .send()
            .await
            .map_err(|e| AppError::Upload(format!("{}", DisplayErrorContext(&e))))?;

        Ok(CompletedPart::builder()
            .set_e_tag(uploaded.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &mut mpsc::Receiver<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut buf = BytesMut::with_capacity(PART_SIZE);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                chunk = body.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };
            buf.extend_from_slice(&chunk);
            if buf.len() >= PART_SIZE {
                let part_number = parts.len() as i32 + 1;
                let part = buf.split().freeze();
                parts.push(self.send_part(key, upload_id, part_number, part).await?);
            }
        }

        // A token fired before the source closed means the producer failed;
        // the close is an abort, not a normal end-of-stream.
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // Trailing partial part; S3 also wants at least one part overall.
        if !buf.is_empty() || parts.is_empty() {
            let part_number = parts.len() as i32 + 1;
            let part = buf.split().freeze();
            parts.push(self.send_part(key, upload_id, part_number, part).await?);
        }
        Ok(parts)
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key, error = %DisplayErrorContext(&e), "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl ArtifactUploader for S3Uploader {
    async fn upload(
        &self,
        key: &str,
        mut body: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let key = self.object_key(key);

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| AppError::Upload(format!("{}", DisplayErrorContext(&e))))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| AppError::Upload("no upload id in create response".to_string()))?
            .to_string();

        let parts = match self.upload_parts(&key, &upload_id, &mut body, &cancel).await {
            Ok(parts) => parts,
            Err(e) => {
                // Leave nothing half-open on the remote side.
                self.abort(&key, &upload_id).await;
                return Err(e);
            }
        };

        // Last cancellation gate before the object becomes visible.
        if cancel.is_cancelled() {
            self.abort(&key, &upload_id).await;
            return Err(AppError::Cancelled);
        }

        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
        {
            self.abort(&key, &upload_id).await;
            return Err(AppError::Upload(format!("{}", DisplayErrorContext(&e))));
        }

        let presigning = PresigningConfig::expires_in(self.url_ttl)
            .map_err(|e| AppError::Upload(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| AppError::Upload(format!("{}", DisplayErrorContext(&e))))?;

        Ok(presigned.uri().to_string())
    }
}
