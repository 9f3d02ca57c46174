/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{
    io::SeekFrom,
    mem,
    ops::Range,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    config::TransferOptions,
    coordinator::{cleanup, Cleanup},
    error::{self, TransferError},
    retry::RetryPolicy,
    scheduler::TransferOperation,
    store::{CompletedPart, ObjectStore},
    types::{Part, TransferRequest},
};

/// Where the bytes of an upload come from
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// In-memory body
    Bytes(Bytes),
    /// Local file, read part by part
    File(PathBuf),
}

impl UploadSource {
    pub(crate) async fn size(&self) -> Result<u64, TransferError> {
        match self {
            UploadSource::Bytes(data) => Ok(data.len() as u64),
            UploadSource::File(path) => {
                let meta = tokio::fs::metadata(path).await.map_err(|e| {
                    error::local_io(format!("read metadata of {} failed", path.display()), e)
                })?;
                Ok(meta.len())
            }
        }
    }

    pub(crate) async fn read_range(&self, range: Range<u64>) -> Result<Bytes, TransferError> {
        match self {
            UploadSource::Bytes(data) => {
                if range.end > data.len() as u64 {
                    return Err(error::fatal(
                        "read upload source failed",
                        format!("range {:?} past end of {} byte body", range, data.len()),
                    ));
                }
                Ok(data.slice(range.start as usize..range.end as usize))
            }
            UploadSource::File(path) => {
                let context = || format!("read {:?} of {} failed", range, path.display());
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| error::local_io(context(), e))?;
                file.seek(SeekFrom::Start(range.start))
                    .await
                    .map_err(|e| error::local_io(context(), e))?;
                let mut buf = vec![0; (range.end - range.start) as usize];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| error::local_io(context(), e))?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(value: Bytes) -> Self {
        UploadSource::Bytes(value)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(value: Vec<u8>) -> Self {
        UploadSource::Bytes(value.into())
    }
}

impl From<PathBuf> for UploadSource {
    fn from(value: PathBuf) -> Self {
        UploadSource::File(value)
    }
}

/// Request to upload an object
#[derive(Debug, Clone)]
pub struct UploadRequest {
    bucket: String,
    key: String,
    source: UploadSource,
    options: TransferOptions,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, source: impl Into<UploadSource>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source: source.into(),
            options: TransferOptions::default(),
        }
    }

    pub fn options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> &UploadSource {
        &self.source
    }

    pub(crate) fn transfer_options(&self) -> &TransferOptions {
        &self.options
    }
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    /// Entity tag of the stored object, if the store returned one
    pub e_tag: Option<String>,
    /// Set for multipart uploads
    pub upload_id: Option<String>,
    /// Parts of a multipart upload in part number order; empty for single requests
    pub parts: Vec<CompletedPart>,
    pub size: u64,
}

/// `PutObject` for small sources, `CreateMultipartUpload` / `UploadPart` /
/// `CompleteMultipartUpload` otherwise. A multipart upload is aborted if the transfer
/// does not complete.
pub(crate) struct UploadOperation {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    source: UploadSource,
    size: u64,
    multipart: bool,
    retry: RetryPolicy,
    upload_id: OnceLock<String>,
    completed: Mutex<Vec<CompletedPart>>,
    // entity tag of a single request upload
    e_tag: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl UploadOperation {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, request: &TransferRequest, source: UploadSource) -> Self {
        Self {
            store,
            bucket: request.bucket().to_owned(),
            key: request.key().to_owned(),
            source,
            size: request.size(),
            multipart: request.is_multipart(),
            retry: *request.settings().retry_policy(),
            upload_id: OnceLock::new(),
            completed: Mutex::new(Vec::new()),
            e_tag: Mutex::new(None),
        }
    }

    fn upload_id(&self) -> Result<&str, TransferError> {
        self.upload_id.get().map(String::as_str).ok_or_else(|| {
            error::fatal(
                format!("upload {}/{} failed", self.bucket, self.key),
                "multipart upload was not created",
            )
        })
    }
}

#[async_trait]
impl TransferOperation for UploadOperation {
    type PartOutput = Option<String>;
    type Output = UploadResponse;

    async fn initiate(&self) -> Result<Option<Cleanup>, TransferError> {
        if !self.multipart {
            return Ok(None);
        }

        let (store, bucket, key) = (&*self.store, self.bucket.as_str(), self.key.as_str());
        let upload_id = self
            .retry
            .retry("create multipart upload", move || {
                store.create_multipart_upload(bucket, key)
            })
            .await?;
        tracing::debug!(bucket, key, upload_id = %upload_id, "created multipart upload");
        // initiate runs once per operation
        let _ = self.upload_id.set(upload_id.clone());

        let store = self.store.clone();
        let (bucket, key) = (self.bucket.clone(), self.key.clone());
        let retry = self.retry;
        Ok(Some(cleanup(move || async move {
            tracing::debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "aborting multipart upload");
            let (store, bucket, key, upload_id) = (&*store, &bucket[..], &key[..], &upload_id[..]);
            retry
                .retry("abort multipart upload", move || {
                    store.abort_multipart_upload(bucket, key, upload_id)
                })
                .await
        })))
    }

    async fn transfer_part(&self, part: &Part) -> Result<Option<String>, TransferError> {
        let body = self.source.read_range(part.range.clone()).await?;
        if !self.multipart {
            return self.store.put_object(&self.bucket, &self.key, body).await;
        }

        let e_tag = self
            .store
            .upload_part(&self.bucket, &self.key, self.upload_id()?, part.part_number, body)
            .await?;
        Ok(Some(e_tag))
    }

    async fn accept(&self, part: &Part, e_tag: Option<String>) -> Result<(), TransferError> {
        if !self.multipart {
            *lock(&self.e_tag) = e_tag;
            return Ok(());
        }

        let e_tag = e_tag.ok_or_else(|| {
            error::fatal(
                format!("upload part {} failed", part.part_number),
                "store returned no entity tag",
            )
        })?;
        lock(&self.completed).push(CompletedPart {
            part_number: part.part_number,
            e_tag,
        });
        Ok(())
    }

    async fn finalize(&self) -> Result<UploadResponse, TransferError> {
        if !self.multipart {
            return Ok(UploadResponse {
                e_tag: lock(&self.e_tag).take(),
                upload_id: None,
                parts: Vec::new(),
                size: self.size,
            });
        }

        let mut parts = mem::take(&mut *lock(&self.completed));
        parts.sort_by_key(|p| p.part_number);
        let upload_id = self.upload_id()?;

        let (store, bucket, key, completed) = (&*self.store, &self.bucket[..], &self.key[..], &parts);
        let e_tag = self
            .retry
            .retry("complete multipart upload", move || {
                store.complete_multipart_upload(bucket, key, upload_id, completed.clone())
            })
            .await?;
        tracing::debug!(bucket, key, upload_id, parts = parts.len(), "completed multipart upload");

        Ok(UploadResponse {
            e_tag,
            upload_id: Some(upload_id.to_owned()),
            parts,
            size: self.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;

    use super::UploadSource;

    #[tokio::test]
    async fn test_read_ranges_of_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world, from a file").unwrap();
        file.flush().unwrap();

        let source = UploadSource::from(file.path().to_path_buf());
        assert_eq!(24, source.size().await.unwrap());
        assert_eq!(Bytes::from_static(b"world"), source.read_range(6..11).await.unwrap());
        assert!(source.read_range(20..30).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_read_ranges_of_bytes_source() {
        let source = UploadSource::from(b"0123456789".to_vec());
        assert_eq!(10, source.size().await.unwrap());
        assert_eq!(Bytes::from_static(b"345"), source.read_range(3..6).await.unwrap());
        assert_eq!(Bytes::new(), source.read_range(0..0).await.unwrap());
        assert!(source.read_range(8..12).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let source = UploadSource::from(std::path::PathBuf::from("/nonexistent/upload/source"));
        assert!(source.size().await.unwrap_err().is_fatal());
    }
}
