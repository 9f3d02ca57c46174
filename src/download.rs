/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{cmp, collections::BinaryHeap, sync::Arc};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{watch, Mutex},
};

use crate::{
    config::TransferOptions,
    error::{self, TransferError},
    object_meta::ObjectMeta,
    scheduler::TransferOperation,
    store::ObjectStore,
    types::{Part, TransferRequest},
};

/// Request to download an object, or a byte range of it
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    bucket: String,
    key: String,
    range: Option<String>,
    options: TransferOptions,
}

impl DownloadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            range: None,
            options: TransferOptions::default(),
        }
    }

    /// Download only the given byte range, as a `Range` header value (e.g. `bytes=0-99`).
    /// Only a single range is supported.
    pub fn range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
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

    pub(crate) fn range_header(&self) -> Option<&str> {
        self.range.as_deref()
    }

    pub(crate) fn transfer_options(&self) -> &TransferOptions {
        &self.options
    }
}

/// Result of a completed download
#[derive(Debug)]
pub struct DownloadResponse<W> {
    /// Metadata of the downloaded object
    pub object_meta: ObjectMeta,
    pub bytes_written: u64,
    /// The destination the object was written to
    pub dest: W,
}

// one downloaded part, ordered by its sequence number
#[derive(Debug, Clone)]
struct ChunkResponse {
    // part number, 1-based
    seq: u64,
    data: Bytes,
}

impl PartialEq for ChunkResponse {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ChunkResponse {}

impl PartialOrd for ChunkResponse {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkResponse {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

// Sequencer maintains the correct chunk ordering. Chunks are downloaded concurrently
// and may not complete in the order they need to be written in.
struct Sequencer {
    // chunks sorted by seq
    responses: BinaryHeap<cmp::Reverse<ChunkResponse>>,
    // next expected seq to write
    next_seq: u64,
}

impl Sequencer {
    fn new() -> Self {
        Self {
            responses: BinaryHeap::new(),
            next_seq: 1,
        }
    }

    fn push(&mut self, chunk: ChunkResponse) {
        self.responses.push(cmp::Reverse(chunk));
    }

    // Next chunk if it is the one expected
    fn pop_next(&mut self) -> Option<ChunkResponse> {
        match self.responses.peek() {
            Some(cmp::Reverse(chunk)) if chunk.seq == self.next_seq => {
                self.next_seq += 1;
                self.responses.pop().map(|r| r.0)
            }
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

struct Sink<W> {
    // taken when the download is finalized
    dest: Option<W>,
    sequencer: Sequencer,
    written: u64,
}

impl<W: AsyncWrite + Unpin> Sink<W> {
    fn dest(&mut self) -> Result<&mut W, TransferError> {
        self.dest
            .as_mut()
            .ok_or_else(|| error::fatal("write to destination failed", "download already finalized"))
    }

    // Write as many sequences as currently possible
    async fn write_available(&mut self) -> Result<u64, TransferError> {
        let mut wc = 0;
        let mut cnt = 0;
        while let Some(chunk) = self.sequencer.pop_next() {
            wc += write_chunk(self.dest()?, chunk.data).await?;
            cnt += 1;
        }
        self.written += wc;
        tracing::trace!("processed {} chunks", cnt);
        Ok(wc)
    }

    // Every part has been accepted, so everything buffered must be writable in order
    async fn write_remaining(&mut self) -> Result<u64, TransferError> {
        let wc = self.write_available().await?;
        if !self.sequencer.is_empty() {
            return Err(error::fatal(
                "write to destination failed",
                format!("part {} never arrived", self.sequencer.next_seq),
            ));
        }
        Ok(wc)
    }
}

// Completely write a chunk to dest
async fn write_chunk<W: AsyncWrite + Unpin>(dest: &mut W, mut data: Bytes) -> Result<u64, TransferError> {
    let mut wc = 0;
    while data.has_remaining() {
        let n = dest
            .write_buf(&mut data)
            .await
            .map_err(|e| error::local_io("write to destination failed", e))?;
        if n == 0 {
            return Err(error::local_io(
                "write to destination failed",
                std::io::ErrorKind::WriteZero.into(),
            ));
        }
        wc += n as u64;
    }
    Ok(wc)
}

/// Ranged `GetObject` per part, written to the destination in part order.
///
/// At most `window` parts past the next unwritten one are started, which bounds the
/// parts buffered in the sequencer to `window` parts worth of bytes.
pub(crate) struct DownloadOperation<W> {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    object_meta: ObjectMeta,
    sink: Mutex<Sink<W>>,
    // next part to write to the destination
    progress: watch::Sender<u64>,
    window: u64,
}

impl<W> DownloadOperation<W> {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        request: &TransferRequest,
        object_meta: ObjectMeta,
        dest: W,
    ) -> Self {
        Self {
            store,
            bucket: request.bucket().to_owned(),
            key: request.key().to_owned(),
            object_meta,
            sink: Mutex::new(Sink {
                dest: Some(dest),
                sequencer: Sequencer::new(),
                written: 0,
            }),
            progress: watch::Sender::new(1),
            window: request.settings.concurrency.max(1) as u64,
        }
    }
}

#[async_trait]
impl<W> TransferOperation for DownloadOperation<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    type PartOutput = Bytes;
    type Output = DownloadResponse<W>;

    async fn ready(&self, part: &Part) {
        let mut progress = self.progress.subscribe();
        let window = self.window;
        // the sender lives as long as `self`, so this only returns once the part fits
        let _ = progress
            .wait_for(|next| part.part_number < next + window)
            .await;
    }

    async fn transfer_part(&self, part: &Part) -> Result<Bytes, TransferError> {
        // an empty object has a single empty part and nothing to fetch
        if part.range.is_empty() {
            return Ok(Bytes::new());
        }

        let range = part.range.start..=part.range.end - 1;
        let data = self.store.get_object(&self.bucket, &self.key, Some(range)).await?;
        if data.len() as u64 != part.size() {
            return Err(error::transient(format!(
                "short read of part {}: expected {} bytes, received {}",
                part.part_number,
                part.size(),
                data.len()
            )));
        }
        Ok(data)
    }

    async fn accept(&self, part: &Part, data: Bytes) -> Result<(), TransferError> {
        let mut sink = self.sink.lock().await;
        tracing::trace!("received chunk; seq={}", part.part_number);
        sink.sequencer.push(ChunkResponse {
            seq: part.part_number,
            data,
        });
        let wc = sink.write_available().await?;
        self.progress.send_replace(sink.sequencer.next_seq);
        tracing::trace!("wrote {} bytes", wc);
        Ok(())
    }

    async fn finalize(&self) -> Result<DownloadResponse<W>, TransferError> {
        let mut sink = self.sink.lock().await;
        tracing::trace!("all chunks received, writing remaining");
        sink.write_remaining().await?;
        sink.dest()?
            .flush()
            .await
            .map_err(|e| error::local_io("flush destination failed", e))?;

        let bytes_written = sink.written;
        let dest = sink
            .dest
            .take()
            .ok_or_else(|| error::fatal("write to destination failed", "download already finalized"))?;
        Ok(DownloadResponse {
            object_meta: self.object_meta.clone(),
            bytes_written,
            dest,
        })
    }
}
