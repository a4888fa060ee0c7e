use crate::infrastructure::storage::s3::S3StorageGateway;
use crate::infrastructure::storage::StorageResult;
use aws_sdk_s3::types::CompletedPart;
use bytes::Bytes;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use futures_util::StreamExt;
use tracing::debug;

// Minimum part size for S3 is 5MB. We use 6MB to be safe.
pub const MIN_PART_SIZE: usize = 6 * 1024 * 1024;

pub struct MultipartUploader<'a> {
    storage: &'a S3StorageGateway,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    part_number: i32,
    buffer: Vec<u8>,
}

impl<'a> MultipartUploader<'a> {
    pub async fn new(storage: &'a S3StorageGateway, key: String, content_type: &str) -> StorageResult<Self> {
        let upload_id = storage.create_multipart_upload(&key, content_type).await?;

        Ok(Self {
            storage,
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
        })
    }

    pub async fn write_chunk(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&chunk);

        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }

        Ok(())
    }

    /// Feed a whole local file through the uploader, reading `read_size` bytes at a time.
    pub async fn stream_file(&mut self, file: &mut File, read_size: usize) -> StorageResult<()> {
        let mut stream = ReaderStream::with_capacity(file, read_size);

        while let Some(chunk) = stream.next().await {
            self.write_chunk(chunk?).await?;
        }

        Ok(())
    }

    async fn flush_part(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let body = Bytes::from(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(MIN_PART_SIZE),
        ));

        let part = self
            .storage
            .upload_part(&self.key, &self.upload_id, self.part_number, body)
            .await?;

        debug!(key = %self.key, part = self.part_number, "Uploaded part");
        self.parts.push(part);
        self.part_number += 1;

        Ok(())
    }

    pub async fn finish(mut self) -> StorageResult<()> {
        // Upload remaining buffer as last part
        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }

        self.storage
            .complete_multipart_upload(&self.key, &self.upload_id, self.parts)
            .await
    }

    pub async fn abort(&self) -> StorageResult<()> {
        self.storage
            .abort_multipart_upload(&self.key, &self.upload_id)
            .await
    }
}
