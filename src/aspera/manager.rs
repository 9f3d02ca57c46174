/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::Semaphore;

use crate::{
    aspera::{
        cache::{CacheInfo, MetadataCache, DEFAULT_MAX_FASP_CACHE_SIZE},
        AsperaMetadata, AsperaMetadataSource, FaspMover, FaspTransferSpec,
    },
    coordinator::{TransferCoordinator, TransferHandle},
    error::{self, TransferError},
    scheduler::spawn_transfer,
    types::{Direction, TransferId},
};

/// Default number of mover invocations a manager runs at once
pub const DEFAULT_ASCP_MAX_CONCURRENT: usize = 10;

/// Configuration for an [`AsperaTransferManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsperaManagerConfig {
    max_fasp_cache_size: usize,
    ascp_max_concurrent: usize,
}

impl AsperaManagerConfig {
    pub fn builder() -> AsperaManagerConfigBuilder {
        AsperaManagerConfigBuilder::default()
    }

    /// Number of buckets whose transfer credentials are cached
    pub fn max_fasp_cache_size(&self) -> usize {
        self.max_fasp_cache_size
    }

    pub fn ascp_max_concurrent(&self) -> usize {
        self.ascp_max_concurrent
    }
}

impl Default for AsperaManagerConfig {
    fn default() -> Self {
        Self {
            max_fasp_cache_size: DEFAULT_MAX_FASP_CACHE_SIZE,
            ascp_max_concurrent: DEFAULT_ASCP_MAX_CONCURRENT,
        }
    }
}

/// Fluent style builder for [AsperaManagerConfig]
#[derive(Debug, Clone, Default)]
pub struct AsperaManagerConfigBuilder {
    config: AsperaManagerConfig,
}

impl AsperaManagerConfigBuilder {
    /// Defaults to 1000.
    pub fn max_fasp_cache_size(mut self, size: usize) -> Self {
        self.config.max_fasp_cache_size = size;
        self
    }

    /// Maximum concurrent mover invocations. Defaults to 10.
    pub fn ascp_max_concurrent(mut self, concurrent: usize) -> Self {
        self.config.ascp_max_concurrent = concurrent;
        self
    }

    pub fn build(self) -> Result<AsperaManagerConfig, TransferError> {
        if self.config.max_fasp_cache_size == 0 {
            return Err(error::invalid_config("max_fasp_cache_size must be positive"));
        }
        if self.config.ascp_max_concurrent == 0 {
            return Err(error::invalid_config("ascp_max_concurrent must be positive"));
        }
        Ok(self.config)
    }
}

/// How the mover shares bandwidth with other traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePolicy {
    /// Transfer at the target rate regardless of congestion
    Fixed,
    High,
    #[default]
    Fair,
    Low,
}

/// Transfer tuning passed through to the mover. Built with [`AsperaConfig::builder`],
/// which rejects inconsistent rates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsperaConfig {
    target_rate_mbps: Option<u64>,
    target_rate_cap_mbps: Option<u64>,
    min_rate_mbps: Option<u64>,
    rate_policy: RatePolicy,
    multi_session: Option<u32>,
    multi_session_threshold_mb: Option<u64>,
    destination_root: Option<String>,
}

impl AsperaConfig {
    pub fn builder() -> AsperaConfigBuilder {
        AsperaConfigBuilder::default()
    }

    pub fn target_rate_mbps(&self) -> Option<u64> {
        self.target_rate_mbps
    }

    pub fn target_rate_cap_mbps(&self) -> Option<u64> {
        self.target_rate_cap_mbps
    }

    pub fn min_rate_mbps(&self) -> Option<u64> {
        self.min_rate_mbps
    }

    pub fn rate_policy(&self) -> RatePolicy {
        self.rate_policy
    }

    /// Number of sessions the transfer is split over
    pub fn multi_session(&self) -> Option<u32> {
        self.multi_session
    }

    pub fn multi_session_threshold_mb(&self) -> Option<u64> {
        self.multi_session_threshold_mb
    }

    pub fn destination_root(&self) -> Option<&str> {
        self.destination_root.as_deref()
    }
}

/// Fluent style builder for [AsperaConfig]
#[derive(Debug, Clone, Default)]
pub struct AsperaConfigBuilder {
    config: AsperaConfig,
}

impl AsperaConfigBuilder {
    pub fn target_rate_mbps(mut self, rate: u64) -> Self {
        self.config.target_rate_mbps = Some(rate);
        self
    }

    pub fn target_rate_cap_mbps(mut self, rate: u64) -> Self {
        self.config.target_rate_cap_mbps = Some(rate);
        self
    }

    pub fn min_rate_mbps(mut self, rate: u64) -> Self {
        self.config.min_rate_mbps = Some(rate);
        self
    }

    /// Defaults to [`RatePolicy::Fair`]
    pub fn rate_policy(mut self, policy: RatePolicy) -> Self {
        self.config.rate_policy = policy;
        self
    }

    /// Split the transfer over this many sessions
    pub fn multi_session(mut self, sessions: u32) -> Self {
        self.config.multi_session = Some(sessions);
        self
    }

    /// Files below this size are not split across sessions
    pub fn multi_session_threshold_mb(mut self, threshold: u64) -> Self {
        self.config.multi_session_threshold_mb = Some(threshold);
        self
    }

    pub fn destination_root(mut self, root: impl Into<String>) -> Self {
        self.config.destination_root = Some(root.into());
        self
    }

    /// Rates that are set must satisfy `min <= target <= cap`
    pub fn build(self) -> Result<AsperaConfig, TransferError> {
        let config = self.config;
        let rates = [config.min_rate_mbps, config.target_rate_mbps, config.target_rate_cap_mbps];
        let set: Vec<u64> = rates.iter().flatten().copied().collect();
        if set.windows(2).any(|w| w[0] > w[1]) {
            return Err(error::invalid_config(format!(
                "rates must satisfy min <= target <= cap, got min {:?} target {:?} cap {:?}",
                config.min_rate_mbps, config.target_rate_mbps, config.target_rate_cap_mbps
            )));
        }
        if config.multi_session == Some(0) {
            return Err(error::invalid_config("multi_session must be positive"));
        }
        Ok(config)
    }
}

/// One accelerated transfer between a local path and a bucket
#[derive(Debug, Clone)]
pub struct AsperaRequest {
    bucket: String,
    remote_path: String,
    local_path: PathBuf,
    config: Option<AsperaConfig>,
    timeout: Option<Duration>,
}

impl AsperaRequest {
    /// `remote_path` is the object key, or the key prefix for directory transfers
    pub fn new(bucket: impl Into<String>, remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            config: None,
            timeout: None,
        }
    }

    /// Override the manager's transfer tuning for this transfer
    pub fn config(mut self, config: AsperaConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Cancel the transfer if it has not finished after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Entry point for accelerated transfers.
///
/// Resolves the bucket's transfer credentials through a [`MetadataCache`] and delegates
/// the transfer to a [`FaspMover`]. Transfers run in the background and are observed and
/// cancelled through their [`TransferHandle`].
#[derive(Debug, Clone)]
pub struct AsperaTransferManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: AsperaManagerConfig,
    transfer_config: AsperaConfig,
    cache: MetadataCache,
    mover: Arc<dyn FaspMover>,
    // bounds concurrent mover invocations
    permits: Semaphore,
}

#[derive(Debug)]
struct Job {
    direction: Direction,
    recursive: bool,
    request: AsperaRequest,
    config: AsperaConfig,
}

impl AsperaTransferManager {
    pub fn new(
        source: Arc<dyn AsperaMetadataSource>,
        mover: Arc<dyn FaspMover>,
        config: AsperaManagerConfig,
        transfer_config: AsperaConfig,
    ) -> Result<Self, TransferError> {
        let cache = MetadataCache::new(source, config.max_fasp_cache_size())?;
        Ok(Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(config.ascp_max_concurrent()),
                config,
                transfer_config,
                cache,
                mover,
            }),
        })
    }

    pub fn config(&self) -> &AsperaManagerConfig {
        &self.inner.config
    }

    /// Transfer credentials of `bucket`, cached
    pub async fn get_aspera_metadata(&self, bucket: &str) -> Result<AsperaMetadata, TransferError> {
        self.inner.cache.get(bucket).await
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.inner.cache.info()
    }

    /// Upload the local file to `remote_path`
    pub fn upload(&self, request: AsperaRequest) -> TransferHandle<()> {
        self.submit(Direction::Upload, false, request)
    }

    /// Download the object at `remote_path` to the local file
    pub fn download(&self, request: AsperaRequest) -> TransferHandle<()> {
        self.submit(Direction::Download, false, request)
    }

    /// Upload the local directory tree under the `remote_path` prefix
    pub fn upload_directory(&self, request: AsperaRequest) -> TransferHandle<()> {
        self.submit(Direction::Upload, true, request)
    }

    /// Download every object under the `remote_path` prefix into the local directory
    pub fn download_directory(&self, request: AsperaRequest) -> TransferHandle<()> {
        self.submit(Direction::Download, true, request)
    }

    fn submit(&self, direction: Direction, recursive: bool, mut request: AsperaRequest) -> TransferHandle<()> {
        let config = request
            .config
            .take()
            .unwrap_or_else(|| self.inner.transfer_config.clone());
        let timeout = request.timeout;
        let job = Job {
            direction,
            recursive,
            request,
            config,
        };
        let inner = self.inner.clone();
        spawn_transfer(TransferId::next(), timeout, move |coordinator| inner.run(coordinator, job))
    }
}

impl Inner {
    async fn run(self: Arc<Self>, coordinator: Arc<TransferCoordinator<()>>, job: Job) {
        // the mover moves the whole transfer as a single part
        if coordinator.start(1) {
            let cancel = coordinator.cancellation_token().clone();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                result = self.transfer(coordinator.id(), job) => result,
            };
            match result {
                Ok(()) => {
                    coordinator.part_succeeded();
                    coordinator.complete(());
                }
                Err(err) => {
                    coordinator.fail(err);
                }
            }
        }
        coordinator.finish();
    }

    async fn transfer(&self, id: TransferId, job: Job) -> Result<(), TransferError> {
        let Job {
            direction,
            recursive,
            request,
            config,
        } = job;

        if direction == Direction::Upload {
            check_local_source(&request.local_path, recursive).await?;
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| error::fatal("ascp pool closed", e))?;
        let credentials = self.cache.get(&request.bucket).await?;
        tracing::debug!(
            transfer = %id,
            bucket = %request.bucket,
            remote_path = %request.remote_path,
            local_path = %request.local_path.display(),
            recursive,
            "starting fasp {}",
            direction
        );

        self.mover
            .transfer(FaspTransferSpec {
                direction,
                bucket: request.bucket,
                remote_path: request.remote_path,
                local_path: request.local_path,
                recursive,
                credentials,
                config,
            })
            .await
    }
}

async fn check_local_source(path: &std::path::Path, directory: bool) -> Result<(), TransferError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| error::local_io(format!("read metadata of {} failed", path.display()), e))?;
    match (directory, meta.is_dir()) {
        (true, false) => Err(error::invalid_meta_request(format!(
            "{} is not a directory",
            path.display()
        ))),
        (false, true) => Err(error::invalid_meta_request(format!(
            "{} is a directory",
            path.display()
        ))),
        _ => Ok(()),
    }
}
