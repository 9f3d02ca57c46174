/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-memory collaborators for tests. DO NOT USE IN PRODUCTION.

use std::{
    collections::{BTreeMap, HashMap},
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::{
    aspera::{AsperaMetadata, AsperaMetadataSource, FaspMover, FaspTransferSpec},
    error::{self, TransferError},
    object_meta::ObjectMeta,
    store::{CompletedPart, ObjectStore},
};

/// Failure injected into a [`MockStore`] operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient error this many times, then succeed
    Transient(usize),
    /// Always fail with a fatal error
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FaultKey {
    HeadObject,
    UploadPart(u64),
    // ranged get starting at this offset
    GetObject(u64),
    PutObject,
    CreateMultipartUpload,
    CompleteMultipartUpload,
    AbortMultipartUpload,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u64, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    calls: HashMap<&'static str, usize>,
    faults: HashMap<FaultKey, Fault>,
}

/// Object store kept in memory, with failure injection and call accounting
#[derive(Debug, Default)]
pub struct MockStore {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn e_tag_of(data: &[u8]) -> String {
    // not a real digest, just stable for identical content
    let sum = data
        .iter()
        .fold(data.len() as u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64));
    format!("\"{:016x}\"", sum)
}

// Counts in-flight requests for as long as it lives
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(in_flight: &'a AtomicUsize, max_in_flight: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every data request (get, put, upload part) by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Store an object directly
    pub fn put(&self, bucket: &str, key: &str, data: Bytes) {
        lock(&self.state)
            .objects
            .insert((bucket.to_owned(), key.to_owned()), data);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        lock(&self.state)
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Number of calls made to the named operation (e.g. `"upload_part"`)
    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.state).calls.get(operation).copied().unwrap_or(0)
    }

    /// Multipart uploads created and neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    /// Highest number of concurrent data requests observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_head_object(&self, fault: Fault) {
        self.inject(FaultKey::HeadObject, fault);
    }

    pub fn fail_upload_part(&self, part_number: u64, fault: Fault) {
        self.inject(FaultKey::UploadPart(part_number), fault);
    }

    /// Fail ranged gets starting at `offset`
    pub fn fail_get_object_at(&self, offset: u64, fault: Fault) {
        self.inject(FaultKey::GetObject(offset), fault);
    }

    pub fn fail_put_object(&self, fault: Fault) {
        self.inject(FaultKey::PutObject, fault);
    }

    pub fn fail_create_multipart_upload(&self, fault: Fault) {
        self.inject(FaultKey::CreateMultipartUpload, fault);
    }

    pub fn fail_complete_multipart_upload(&self, fault: Fault) {
        self.inject(FaultKey::CompleteMultipartUpload, fault);
    }

    pub fn fail_abort_multipart_upload(&self, fault: Fault) {
        self.inject(FaultKey::AbortMultipartUpload, fault);
    }

    fn inject(&self, key: FaultKey, fault: Fault) {
        lock(&self.state).faults.insert(key, fault);
    }

    // Count the call and apply any injected fault
    fn call(&self, operation: &'static str, key: Option<FaultKey>) -> Result<(), TransferError> {
        let mut state = lock(&self.state);
        *state.calls.entry(operation).or_insert(0) += 1;
        let Some(key) = key else {
            return Ok(());
        };
        match state.faults.get_mut(&key) {
            Some(Fault::Fatal) => Err(error::fatal(
                format!("{} failed", operation),
                "injected fatal fault",
            )),
            Some(Fault::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error::transient(format!("{}: injected transient fault", operation)))
            }
            _ => Ok(()),
        }
    }

    async fn data_request(&self) -> InFlight<'_> {
        let guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, TransferError> {
        self.call("head_object", Some(FaultKey::HeadObject))?;
        let data = self.object(bucket, key).ok_or_else(|| {
            error::fatal(format!("head object {}/{} failed", bucket, key), "404 not found")
        })?;
        Ok(ObjectMeta {
            content_length: Some(data.len() as i64),
            e_tag: Some(e_tag_of(&data)),
            ..Default::default()
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<RangeInclusive<u64>>,
    ) -> Result<Bytes, TransferError> {
        let _in_flight = self.data_request().await;
        let fault = range.as_ref().map(|r| FaultKey::GetObject(*r.start()));
        self.call("get_object", fault)?;
        let data = self.object(bucket, key).ok_or_else(|| {
            error::fatal(format!("get object {}/{} failed", bucket, key), "404 not found")
        })?;
        let Some(range) = range else {
            return Ok(data);
        };

        let len = data.len() as u64;
        if *range.start() >= len {
            return Err(error::fatal(
                format!("get object {}/{} failed", bucket, key),
                "416 range not satisfiable",
            ));
        }
        // like S3, a range running past the end is cut short
        let end = (*range.end()).min(len - 1);
        Ok(data.slice(*range.start() as usize..=end as usize))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<Option<String>, TransferError> {
        let _in_flight = self.data_request().await;
        self.call("put_object", Some(FaultKey::PutObject))?;
        let e_tag = e_tag_of(&body);
        self.put(bucket, key, body);
        Ok(Some(e_tag))
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, TransferError> {
        self.call("create_multipart_upload", Some(FaultKey::CreateMultipartUpload))?;
        let mut state = lock(&self.state);
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u64,
        body: Bytes,
    ) -> Result<String, TransferError> {
        let _in_flight = self.data_request().await;
        self.call("upload_part", Some(FaultKey::UploadPart(part_number)))?;
        let mut state = lock(&self.state);
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| {
                error::fatal(format!("upload part {} failed", part_number), "no such upload")
            })?;
        let e_tag = e_tag_of(&body);
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, TransferError> {
        self.call("complete_multipart_upload", Some(FaultKey::CompleteMultipartUpload))?;
        let mut state = lock(&self.state);
        let context = || format!("complete multipart upload {}/{} failed", bucket, key);
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| error::fatal(context(), "no such upload"))?;

        let mut body = BytesMut::new();
        for (idx, part) in parts.iter().enumerate() {
            match upload.parts.get(&part.part_number) {
                Some((e_tag, data)) if part.part_number == idx as u64 + 1 && *e_tag == part.e_tag => {
                    body.extend_from_slice(data);
                }
                _ => return Err(error::fatal(context(), format!("invalid part {}", part.part_number))),
            }
        }

        let body = body.freeze();
        let e_tag = format!("{}-{}", e_tag_of(&body), parts.len());
        state.objects.insert((upload.bucket, upload.key), body);
        Ok(Some(e_tag))
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), TransferError> {
        self.call("abort_multipart_upload", Some(FaultKey::AbortMultipartUpload))?;
        lock(&self.state)
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| {
                error::fatal(
                    format!("abort multipart upload {}/{} failed", bucket, key),
                    "no such upload",
                )
            })
    }
}

/// Control plane double that derives credentials from the bucket name.
///
/// Each fetch of a bucket returns a new generation of credentials so refetches are
/// observable.
#[derive(Debug, Default)]
pub struct MockAsperaSource {
    fetches: Mutex<HashMap<String, usize>>,
    failing: Mutex<Vec<String>>,
}

impl MockAsperaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every lookup of `bucket`
    pub fn fail_bucket(&self, bucket: &str) {
        lock(&self.failing).push(bucket.to_owned());
    }

    /// Number of lookups of `bucket` that reached the control plane
    pub fn fetches(&self, bucket: &str) -> usize {
        lock(&self.fetches).get(bucket).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        lock(&self.fetches).values().sum()
    }
}

#[async_trait]
impl AsperaMetadataSource for MockAsperaSource {
    async fn get_bucket_aspera(&self, bucket: &str) -> Result<AsperaMetadata, TransferError> {
        if lock(&self.failing).iter().any(|b| b == bucket) {
            return Err(error::fatal(
                format!("get bucket aspera {} failed", bucket),
                "403 access denied",
            ));
        }
        let generation = {
            let mut fetches = lock(&self.fetches);
            let n = fetches.entry(bucket.to_owned()).or_insert(0);
            *n += 1;
            *n
        };
        Ok(AsperaMetadata::new(
            format!("access-key-{}-{}", bucket, generation),
            format!("secret-key-{}-{}", bucket, generation),
            format!("https://ats-{}.example.com", bucket),
        ))
    }
}

/// Mover double that records every transfer spec it is handed
#[derive(Debug, Default)]
pub struct MockMover {
    transfers: Mutex<Vec<FaspTransferSpec>>,
    delay: Mutex<Option<Duration>>,
    fail: Mutex<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Fail every transfer from now on
    pub fn fail_transfers(&self) {
        *lock(&self.fail) = true;
    }

    pub fn transfers(&self) -> Vec<FaspTransferSpec> {
        lock(&self.transfers).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaspMover for MockMover {
    async fn transfer(&self, spec: FaspTransferSpec) -> Result<(), TransferError> {
        let guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        drop(guard);

        if *lock(&self.fail) {
            return Err(error::fatal("fasp transfer failed", "ascp exited with status 1"));
        }
        lock(&self.transfers).push(spec);
        Ok(())
    }
}

