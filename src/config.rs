/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{cmp, time::Duration};

use crate::{
    chunk::ChunkPolicy,
    error::{self, TransferError},
    retry::RetryPolicy,
    MEBI_BYTE,
};

/// Default number of parts in flight across all transfers of a scheduler
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Objects at or above this size are transferred in multiple parts
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 8 * MEBI_BYTE;

/// Default target part size
pub const DEFAULT_MULTIPART_CHUNKSIZE: u64 = 8 * MEBI_BYTE;

/// Default number of retries for a part failing with a transient error
pub const DEFAULT_MAX_RETRIES_PER_PART: u32 = 5;

pub(crate) const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Configuration for a [`TransferManager`](crate::manager::TransferManager)
#[derive(Debug, Clone)]
pub struct Config {
    max_concurrency: usize,
    max_concurrency_per_transfer: Option<usize>,
    max_bandwidth_bytes_per_sec: Option<u64>,
    multipart_threshold: u64,
    multipart_chunksize: u64,
    max_retries_per_part: u32,
    retry_base_delay: Duration,
    chunk_policy: ChunkPolicy,
}

impl Config {
    /// Create a new `Config` builder
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Maximum number of parts in flight across _all_ transfers
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Maximum number of parts in flight for a single transfer, if limited
    pub fn max_concurrency_per_transfer(&self) -> Option<usize> {
        self.max_concurrency_per_transfer
    }

    /// Aggregate throughput ceiling; `None` means unlimited
    pub fn max_bandwidth_bytes_per_sec(&self) -> Option<u64> {
        self.max_bandwidth_bytes_per_sec
    }

    pub fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold
    }

    /// Target part size used when a transfer does not override it
    pub fn multipart_chunksize(&self) -> u64 {
        self.multipart_chunksize
    }

    pub fn max_retries_per_part(&self) -> u32 {
        self.max_retries_per_part
    }

    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }

    /// Provider limits used to plan multipart transfers
    pub fn chunk_policy(&self) -> &ChunkPolicy {
        &self.chunk_policy
    }
}

impl Default for Config {
    fn default() -> Self {
        Builder::default()
            .build()
            .expect("default configuration is valid")
    }
}

/// Fluent style builder for [Config]
#[derive(Debug, Clone)]
pub struct Builder {
    max_concurrency: usize,
    max_concurrency_per_transfer: Option<usize>,
    max_bandwidth_bytes_per_sec: Option<u64>,
    multipart_threshold: u64,
    multipart_chunksize: u64,
    max_retries_per_part: u32,
    retry_base_delay: Duration,
    chunk_policy: ChunkPolicy,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CONCURRENCY,
            max_concurrency_per_transfer: None,
            max_bandwidth_bytes_per_sec: None,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multipart_chunksize: DEFAULT_MULTIPART_CHUNKSIZE,
            max_retries_per_part: DEFAULT_MAX_RETRIES_PER_PART,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            chunk_policy: ChunkPolicy::default(),
        }
    }
}

impl Builder {
    /// Size of the worker pool shared by every transfer. Defaults to 10.
    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    /// Optional ceiling on parts in flight for one transfer.
    pub fn max_concurrency_per_transfer(mut self, concurrency: usize) -> Self {
        self.max_concurrency_per_transfer = Some(concurrency);
        self
    }

    /// Throttle aggregate throughput to `bytes_per_sec`. Zero disables throttling.
    pub fn max_bandwidth_bytes_per_sec(mut self, bytes_per_sec: u64) -> Self {
        self.max_bandwidth_bytes_per_sec = Some(bytes_per_sec).filter(|b| *b > 0);
        self
    }

    /// Minimum object size that triggers a multipart transfer. Defaults to 8 MiB.
    pub fn multipart_threshold(mut self, threshold_bytes: u64) -> Self {
        self.multipart_threshold = threshold_bytes;
        self
    }

    /// Size of parts the object will be transferred in, in bytes.
    /// Values below the provider's minimum part size (5 MiB) are rounded up.
    /// Defaults to 8 MiB.
    ///
    /// NOTE: The actual part size may be larger if this value would result in more
    /// parts than the provider allows for a single object.
    pub fn multipart_chunksize(mut self, size_bytes: u64) -> Self {
        self.multipart_chunksize = size_bytes;
        self
    }

    /// Retries of a part that fails with a transient error. Defaults to 5.
    pub fn max_retries_per_part(mut self, retries: u32) -> Self {
        self.max_retries_per_part = retries;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Override the provider limits (minimum/maximum part size, maximum part count)
    pub fn chunk_policy(mut self, policy: ChunkPolicy) -> Self {
        self.chunk_policy = policy;
        self
    }

    /// Consumes the builder and constructs a [`Config`]
    pub fn build(self) -> Result<Config, TransferError> {
        if self.max_concurrency == 0 {
            return Err(error::invalid_config("max_concurrency must be at least 1"));
        }
        if self.max_concurrency_per_transfer == Some(0) {
            return Err(error::invalid_config(
                "max_concurrency_per_transfer must be at least 1",
            ));
        }
        if self.multipart_threshold == 0 {
            return Err(error::invalid_config("multipart_threshold must be positive"));
        }

        let chunksize = cmp::max(self.multipart_chunksize, self.chunk_policy.min_part_size());
        if chunksize > self.chunk_policy.max_part_size() {
            return Err(error::invalid_config(format!(
                "multipart_chunksize {} exceeds the maximum part size {}",
                chunksize,
                self.chunk_policy.max_part_size()
            )));
        }

        Ok(Config {
            max_concurrency: self.max_concurrency,
            max_concurrency_per_transfer: self.max_concurrency_per_transfer,
            max_bandwidth_bytes_per_sec: self.max_bandwidth_bytes_per_sec,
            multipart_threshold: self.multipart_threshold,
            multipart_chunksize: chunksize,
            max_retries_per_part: self.max_retries_per_part,
            retry_base_delay: self.retry_base_delay,
            chunk_policy: self.chunk_policy,
        })
    }
}

/// Per-transfer overrides of the manager's [`Config`]
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    concurrency: Option<usize>,
    part_size: Option<u64>,
    max_retries: Option<u32>,
    timeout: Option<Duration>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of parts of this transfer in flight at once
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn part_size(mut self, size_bytes: u64) -> Self {
        self.part_size = Some(size_bytes);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Cancel the transfer if it has not finished after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Settings snapshot of one transfer, resolved from [`Config`] and [`TransferOptions`]
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub(crate) concurrency: usize,
    pub(crate) part_size_hint: u64,
    pub(crate) retry: RetryPolicy,
    pub(crate) timeout: Option<Duration>,
}

impl TransferSettings {
    pub(crate) fn resolve(config: &Config, options: &TransferOptions) -> Result<Self, TransferError> {
        let concurrency = options
            .concurrency
            .or(config.max_concurrency_per_transfer)
            .unwrap_or(config.max_concurrency);
        if concurrency == 0 {
            return Err(error::invalid_config("transfer concurrency must be at least 1"));
        }

        let policy = config.chunk_policy();
        let part_size_hint = match options.part_size {
            Some(size) => cmp::max(size, policy.min_part_size()),
            None => config.multipart_chunksize,
        };
        if part_size_hint > policy.max_part_size() {
            return Err(error::invalid_config(format!(
                "part size {} exceeds the maximum part size {}",
                part_size_hint,
                policy.max_part_size()
            )));
        }

        if options.timeout == Some(Duration::ZERO) {
            return Err(error::invalid_config("transfer timeout must be non-zero"));
        }

        Ok(Self {
            concurrency,
            part_size_hint,
            retry: RetryPolicy::new(
                options.max_retries.unwrap_or(config.max_retries_per_part),
                config.retry_base_delay,
            ),
            timeout: options.timeout,
        })
    }

    /// Parts of this transfer allowed in flight at once
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn part_size_hint(&self) -> u64 {
        self.part_size_hint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
