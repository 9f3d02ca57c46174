/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{fmt, ops::RangeInclusive};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::TransferError, object_meta::ObjectMeta};

/// A part accepted by the store as part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u64,
    pub e_tag: String,
}

/// Object store operations the transfer engine is built on.
///
/// Implementations report recoverable network/server conditions as
/// [`TransferError::TransientIo`]; everything else is treated as fatal by the scheduler.
#[async_trait]
pub trait ObjectStore: fmt::Debug + Send + Sync + 'static {
    /// Fetch object metadata; used to discover the object size
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, TransferError>;

    /// Fetch the object body, or only the given inclusive byte range
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<RangeInclusive<u64>>,
    ) -> Result<Bytes, TransferError>;

    /// Upload an object in a single request; returns the entity tag if the store sent one
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<Option<String>, TransferError>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, TransferError>;

    /// Upload one part and return its entity tag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u64,
        body: Bytes,
    ) -> Result<String, TransferError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, TransferError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), TransferError>;
}
