/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Accelerated (FASP) transfers.
//!
//! Transfers are delegated to an external mover. This module resolves the per-bucket
//! transfer credentials through the control plane, caches them, and hands the mover a
//! complete [`FaspTransferSpec`].

use std::{fmt, path::PathBuf};

use async_trait::async_trait;

use crate::{error::TransferError, types::Direction};

pub mod cache;
pub mod manager;

pub use cache::{CacheInfo, MetadataCache, DEFAULT_MAX_FASP_CACHE_SIZE};
pub use manager::{
    AsperaConfig, AsperaConfigBuilder, AsperaManagerConfig, AsperaManagerConfigBuilder, AsperaRequest,
    AsperaTransferManager, RatePolicy, DEFAULT_ASCP_MAX_CONCURRENT,
};

/// Credentials and endpoint for accelerated transfers to one bucket
#[derive(Clone, PartialEq, Eq)]
pub struct AsperaMetadata {
    access_key: String,
    secret_key: String,
    ats_endpoint: String,
}

impl AsperaMetadata {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        ats_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            ats_endpoint: ats_endpoint.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// Accelerated transfer service endpoint
    pub fn ats_endpoint(&self) -> &str {
        &self.ats_endpoint
    }
}

impl fmt::Debug for AsperaMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsperaMetadata")
            .field("access_key", &self.access_key)
            .field("secret_key", &"** redacted **")
            .field("ats_endpoint", &self.ats_endpoint)
            .finish()
    }
}

/// Control plane lookup of a bucket's accelerated transfer credentials
#[async_trait]
pub trait AsperaMetadataSource: fmt::Debug + Send + Sync + 'static {
    async fn get_bucket_aspera(&self, bucket: &str) -> Result<AsperaMetadata, TransferError>;
}

/// Everything the external mover needs to run one accelerated transfer
#[derive(Debug, Clone, PartialEq)]
pub struct FaspTransferSpec {
    pub direction: Direction,
    pub bucket: String,
    /// Object key, or key prefix for directory transfers
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Transfer a directory tree rather than a single file
    pub recursive: bool,
    pub credentials: AsperaMetadata,
    pub config: AsperaConfig,
}

/// External process or service that moves the bytes of an accelerated transfer
#[async_trait]
pub trait FaspMover: fmt::Debug + Send + Sync + 'static {
    async fn transfer(&self, spec: FaspTransferSpec) -> Result<(), TransferError>;
}
