/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

/* Automatically managed default lints */
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
/* End of automatically managed default lints */

//! S3 Transfer Engine
//!
//! Moves large objects between local storage and an S3 compatible object store by
//! splitting them into parts that are transferred concurrently, retried independently,
//! and throttled against a shared bandwidth budget. Multipart uploads that fail or are
//! cancelled are aborted so no orphaned parts remain.
//!
//! Accelerated transfers through an external FASP mover live in [`aspera`].
//!
//! # Crate Features
//!
//! - `test-util`: Enables in-memory object store and mover doubles for unit tests. DO NOT ENABLE IN PRODUCTION.

#![warn(
    // TODO - re-enable missing_docs,
    rustdoc::missing_crate_level_docs,
    unreachable_pub,
    rust_2018_idioms
)]

pub(crate) const MEBI_BYTE: u64 = 1024 * 1024;
pub(crate) const GIBI_BYTE: u64 = MEBI_BYTE * 1024;
pub(crate) const MIN_PART_SIZE: u64 = 5 * MEBI_BYTE;

mod discovery;
mod header;
mod s3;

pub mod aspera;
pub mod bandwidth;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod manager;
pub mod object_meta;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod upload;

/// In-memory doubles of the object store, control plane, and mover
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use bandwidth::BandwidthLimiter;
pub use chunk::ChunkPolicy;
pub use config::{Config, TransferOptions};
pub use coordinator::{TransferHandle, TransferStatus};
pub use download::{DownloadRequest, DownloadResponse};
pub use error::TransferError;
pub use manager::TransferManager;
pub use scheduler::TaskScheduler;
pub use store::ObjectStore;
pub use upload::{UploadRequest, UploadResponse, UploadSource};
