/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::sync::Arc;

use aws_types::SdkConfig;
use tokio::io::AsyncWrite;

use crate::{
    config::{Config, TransferSettings},
    coordinator::TransferHandle,
    discovery::discover_obj_size,
    download::{DownloadOperation, DownloadRequest, DownloadResponse},
    error::TransferError,
    scheduler::TaskScheduler,
    store::ObjectStore,
    types::{Direction, TransferId, TransferRequest},
    upload::{UploadOperation, UploadRequest, UploadResponse},
};

/// Entry point for object store uploads and downloads.
///
/// Every call returns a [`TransferHandle`] immediately; size discovery, planning and the
/// transfer itself run in the background on the manager's [`TaskScheduler`]. Cloning is
/// cheap and clones share the scheduler.
#[derive(Debug, Clone)]
pub struct TransferManager {
    handle: Arc<Handle>,
}

#[derive(Debug)]
struct Handle {
    config: Config,
    store: Arc<dyn ObjectStore>,
    scheduler: TaskScheduler,
}

impl TransferManager {
    /// Manager with its own scheduler sized by `config`
    pub fn new(store: impl ObjectStore, config: Config) -> Self {
        let scheduler = TaskScheduler::from_config(&config);
        Self::with_scheduler(Arc::new(store), config, scheduler)
    }

    /// Manager submitting to an existing, possibly shared, scheduler
    pub fn with_scheduler(store: Arc<dyn ObjectStore>, config: Config, scheduler: TaskScheduler) -> Self {
        Self {
            handle: Arc::new(Handle {
                config,
                store,
                scheduler,
            }),
        }
    }

    /// Manager for Amazon S3 using the given SDK configuration
    pub fn from_sdk_config(sdk_config: &SdkConfig, config: Config) -> Self {
        Self::new(aws_sdk_s3::Client::new(sdk_config), config)
    }

    pub fn config(&self) -> &Config {
        &self.handle.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.handle.scheduler
    }

    /// Upload an object. Sources of at least `multipart_threshold` bytes are uploaded
    /// in parts, and the multipart upload is aborted if the transfer fails or is cancelled.
    pub fn upload(&self, request: UploadRequest) -> TransferHandle<UploadResponse> {
        let settings = match TransferSettings::resolve(&self.handle.config, request.transfer_options()) {
            Ok(settings) => settings,
            Err(err) => return rejected(err),
        };
        let id = TransferId::next();
        let timeout = settings.timeout();
        self.handle
            .scheduler
            .submit_with(id, timeout, self.handle.clone().prepare_upload(id, settings, request))
    }

    /// Download an object (or the requested range of it) into `dest`.
    ///
    /// Parts are fetched concurrently and written to `dest` strictly in order; `dest` is
    /// returned in the [`DownloadResponse`].
    pub fn download<W>(&self, dest: W, request: DownloadRequest) -> TransferHandle<DownloadResponse<W>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let settings = match TransferSettings::resolve(&self.handle.config, request.transfer_options()) {
            Ok(settings) => settings,
            Err(err) => return rejected(err),
        };
        let id = TransferId::next();
        let timeout = settings.timeout();
        self.handle.scheduler.submit_with(
            id,
            timeout,
            self.handle.clone().prepare_download(id, settings, request, dest),
        )
    }
}

fn rejected<T: Send + 'static>(err: TransferError) -> TransferHandle<T> {
    tracing::debug!(error = %err, "transfer rejected");
    TransferHandle::rejected(err)
}

impl Handle {
    async fn prepare_upload(
        self: Arc<Self>,
        id: TransferId,
        settings: TransferSettings,
        request: UploadRequest,
    ) -> Result<(TransferRequest, UploadOperation), TransferError> {
        let size = request.source().size().await?;
        let multipart = size >= self.config.multipart_threshold();
        tracing::debug!(
            transfer = %id,
            bucket = request.bucket(),
            key = request.key(),
            size,
            multipart,
            "starting upload"
        );
        let transfer = TransferRequest::new(
            id,
            Direction::Upload,
            request.bucket(),
            request.key(),
            0..size,
            multipart,
            settings,
        );
        let operation = UploadOperation::new(self.store.clone(), &transfer, request.source().clone());
        Ok((transfer, operation))
    }

    async fn prepare_download<W>(
        self: Arc<Self>,
        id: TransferId,
        settings: TransferSettings,
        request: DownloadRequest,
        dest: W,
    ) -> Result<(TransferRequest, DownloadOperation<W>), TransferError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let discovery = discover_obj_size(&*self.store, &request, *settings.retry_policy()).await?;
        let range = discovery.byte_range();
        let multipart = range.end - range.start >= self.config.multipart_threshold();
        tracing::debug!(
            transfer = %id,
            bucket = request.bucket(),
            key = request.key(),
            ?range,
            multipart,
            "starting download"
        );
        let transfer = TransferRequest::new(
            id,
            Direction::Download,
            request.bucket(),
            request.key(),
            range,
            multipart,
            settings,
        );
        let operation = DownloadOperation::new(self.store.clone(), &transfer, discovery.object_meta, dest);
        Ok((transfer, operation))
    }
}
