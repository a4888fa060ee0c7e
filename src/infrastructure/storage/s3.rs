use std::io;
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::{config::BehaviorVersion, config::Credentials, config::Region, Client};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{StorageError, StorageGateway, StorageResult};
use crate::common::upload::{MultipartUploader, MIN_PART_SIZE};
use crate::config::settings::S3Settings;

/// Files above this size are published with a multipart upload.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct S3StorageGateway {
    client: Client,
    raw_bucket: String,
    processed_bucket: String,
    public_read: bool,
}

impl S3StorageGateway {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "static",
        );

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(&settings.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO
            .build();

        let client = Client::from_conf(config);

        info!(
            endpoint = %settings.endpoint,
            raw_bucket = %settings.raw_bucket,
            processed_bucket = %settings.processed_bucket,
            "✅ Connected to S3 (MinIO)"
        );

        Self {
            client,
            raw_bucket: settings.raw_bucket.clone(),
            processed_bucket: settings.processed_bucket.clone(),
            public_read: settings.public_read,
        }
    }

    fn acl(&self) -> Option<ObjectCannedAcl> {
        self.public_read.then_some(ObjectCannedAcl::PublicRead)
    }

    pub async fn create_multipart_upload(&self, key: &str, content_type: &str) -> StorageResult<String> {
        let result = self
            .client
            .create_multipart_upload()
            .bucket(&self.processed_bucket)
            .key(key)
            .content_type(content_type)
            .set_acl(self.acl())
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        result
            .upload_id
            .ok_or_else(|| StorageError::Transient(format!("no upload id returned for {}", key)))
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
    ) -> StorageResult<CompletedPart> {
        let result = self
            .client
            .upload_part()
            .bucket(&self.processed_bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        let e_tag = result.e_tag.ok_or_else(|| {
            StorageError::Transient(format!("no etag returned for part {} of {}", part_number, key))
        })?;

        Ok(CompletedPart::builder()
            .e_tag(e_tag)
            .part_number(part_number)
            .build())
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.processed_bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        Ok(())
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.processed_bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        Ok(())
    }

    async fn put_whole(&self, local_path: &Path, remote_key: &str, content_type: &str) -> StorageResult<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.processed_bucket)
            .key(remote_key)
            .body(body)
            .content_type(content_type)
            .set_acl(self.acl())
            .send()
            .await
            .map_err(|e| classify(remote_key, e))?;

        Ok(())
    }

    async fn put_multipart(&self, local_path: &Path, remote_key: &str, content_type: &str) -> StorageResult<()> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut uploader = MultipartUploader::new(self, remote_key.to_string(), content_type).await?;

        let streamed = uploader.stream_file(&mut file, MIN_PART_SIZE).await;
        match streamed {
            Ok(()) => uploader.finish().await,
            Err(e) => {
                if let Err(abort_err) = uploader.abort().await {
                    tracing::warn!(key = %remote_key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StorageGateway for S3StorageGateway {
    async fn fetch(&self, remote_key: &str, local_path: &Path) -> StorageResult<()> {
        let output = self
            .client
            .get_object()
            .bucket(&self.raw_bucket)
            .key(remote_key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    StorageError::NotFound(remote_key.to_string())
                } else {
                    classify(remote_key, e)
                }
            })?;

        let mut body = output.body;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::Transient(format!("download of {} interrupted: {}", remote_key, e))
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        info!(
            key = %remote_key,
            bucket = %self.raw_bucket,
            path = %local_path.display(),
            size_bytes = written,
            "⬇️ Fetched object"
        );
        Ok(())
    }

    async fn publish(&self, local_path: &Path, remote_key: &str) -> StorageResult<()> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let content_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .to_string();

        if size > MULTIPART_THRESHOLD {
            self.put_multipart(local_path, remote_key, &content_type).await?;
        } else {
            self.put_whole(local_path, remote_key, &content_type).await?;
        }

        info!(
            key = %remote_key,
            bucket = %self.processed_bucket,
            size_bytes = size,
            "⬆️ Published object"
        );
        Ok(())
    }

    async fn close(&self) {
        info!("S3 storage gateway closed");
    }
}

fn classify<E>(key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    match status {
        Some(404) => StorageError::NotFound(key.to_string()),
        _ => StorageError::Transient(format!("{}: {}", key, DisplayErrorContext(&err))),
    }
}
