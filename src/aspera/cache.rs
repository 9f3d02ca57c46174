/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    aspera::{AsperaMetadata, AsperaMetadataSource},
    error::{self, TransferError},
};

/// Default number of buckets whose credentials are kept
pub const DEFAULT_MAX_FASP_CACHE_SIZE: usize = 1000;

/// Snapshot of the cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub hits: u64,
    pub misses: u64,
    pub max_size: usize,
    pub current_size: usize,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, AsperaMetadata>,
    // least recently used at the front
    recency: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl Entries {
    fn touch(&mut self, bucket: &str) {
        if let Some(pos) = self.recency.iter().position(|b| b == bucket) {
            if let Some(b) = self.recency.remove(pos) {
                self.recency.push_back(b);
            }
        }
    }

    fn remove_oldest_entry(&mut self) {
        if let Some(bucket) = self.recency.pop_front() {
            tracing::trace!(bucket = %bucket, "evicting aspera metadata");
            self.map.remove(&bucket);
        }
    }
}

/// Bounded least-recently-used cache of per-bucket accelerated transfer credentials.
///
/// Misses are fetched from the [`AsperaMetadataSource`] without holding the cache lock,
/// so concurrent misses of the same bucket each fetch and the last insert wins. A
/// failed fetch counts as a miss and caches nothing. Entries never expire.
pub struct MetadataCache {
    source: Arc<dyn AsperaMetadataSource>,
    capacity: usize,
    entries: Mutex<Entries>,
}

impl fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataCache")
            .field("source", &self.source)
            .field("info", &self.info())
            .finish()
    }
}

impl MetadataCache {
    pub fn new(source: Arc<dyn AsperaMetadataSource>, capacity: usize) -> Result<Self, TransferError> {
        if capacity == 0 {
            return Err(error::invalid_config("max_fasp_cache_size must be positive"));
        }
        Ok(Self {
            source,
            capacity,
            entries: Mutex::new(Entries::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Credentials for `bucket`, from the cache or fetched from the control plane
    pub async fn get(&self, bucket: &str) -> Result<AsperaMetadata, TransferError> {
        {
            let mut entries = self.lock();
            if let Some(meta) = entries.map.get(bucket).cloned() {
                entries.hits += 1;
                entries.touch(bucket);
                tracing::trace!(bucket, "aspera metadata cache hit");
                return Ok(meta);
            }
            entries.misses += 1;
        }

        tracing::debug!(bucket, "aspera metadata cache miss, fetching");
        let meta = self.source.get_bucket_aspera(bucket).await?;
        self.insert(bucket, meta.clone());
        Ok(meta)
    }

    fn insert(&self, bucket: &str, meta: AsperaMetadata) {
        let mut entries = self.lock();
        if entries.map.insert(bucket.to_owned(), meta).is_some() {
            // a concurrent miss got here first
            entries.touch(bucket);
        } else {
            entries.recency.push_back(bucket.to_owned());
        }
        while entries.map.len() > self.capacity {
            entries.remove_oldest_entry();
        }
    }

    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    pub fn misses(&self) -> u64 {
        self.lock().misses
    }

    /// Number of cached buckets
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn info(&self) -> CacheInfo {
        let entries = self.lock();
        CacheInfo {
            hits: entries.hits,
            misses: entries.misses,
            max_size: self.capacity,
            current_size: entries.map.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{CacheInfo, MetadataCache, DEFAULT_MAX_FASP_CACHE_SIZE};
    use crate::test_util::MockAsperaSource;

    fn assert_info(cache: &MetadataCache, hits: u64, misses: u64, current_size: usize) {
        assert_eq!(
            CacheInfo {
                hits,
                misses,
                max_size: cache.capacity(),
                current_size,
            },
            cache.info()
        );
    }

    #[tokio::test]
    async fn test_capacity_ten_scenario() {
        let source = Arc::new(MockAsperaSource::new());
        let cache = MetadataCache::new(source.clone(), 10).unwrap();

        for i in 0..10 {
            cache.get(&format!("k{i}")).await.unwrap();
        }
        assert_info(&cache, 0, 10, 10);

        for i in 0..10 {
            cache.get(&format!("k{i}")).await.unwrap();
        }
        assert_info(&cache, 10, 10, 10);

        // evicts k0, the least recently used
        cache.get("k10").await.unwrap();
        assert_info(&cache, 10, 11, 10);

        // refetched, evicts k1
        let k0 = cache.get("k0").await.unwrap();
        assert_eq!("access-key-k0-2", k0.access_key());
        assert_info(&cache, 10, 12, 10);

        for i in 2..10 {
            cache.get(&format!("k{i}")).await.unwrap();
        }
        assert_info(&cache, 18, 12, 10);
        assert_eq!(1, source.fetches("k1"));
        assert_eq!(12, source.total_fetches());
    }

    #[tokio::test]
    async fn test_lru_cache_eviction() {
        for capacity in [DEFAULT_MAX_FASP_CACHE_SIZE, 10, 100] {
            let source = Arc::new(MockAsperaSource::new());
            let cache = MetadataCache::new(source.clone(), capacity).unwrap();

            for i in 0..capacity {
                cache.get(&format!("foo{i}")).await.unwrap();
            }
            assert_info(&cache, 0, capacity as u64, capacity);

            // replaces foo0
            cache.get("newbucket").await.unwrap();
            assert_info(&cache, 0, capacity as u64 + 1, capacity);

            // foo0 was evicted, this replaces foo1
            let response = cache.get("foo0").await.unwrap();
            assert_info(&cache, 0, capacity as u64 + 2, capacity);
            assert_ne!("access-key-foo0-1", response.access_key());
            assert_ne!("secret-key-foo0-1", response.secret_key());

            // all other entries remain
            for i in 2..capacity {
                let response = cache.get(&format!("foo{i}")).await.unwrap();
                assert_eq!(format!("access-key-foo{i}-1"), response.access_key());
                assert_eq!(format!("secret-key-foo{i}-1"), response.secret_key());
                assert_eq!(format!("https://ats-foo{i}.example.com"), response.ats_endpoint());
            }
            assert_info(&cache, capacity as u64 - 2, capacity as u64 + 2, capacity);
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_is_a_miss_and_not_cached() {
        let source = Arc::new(MockAsperaSource::new());
        source.fail_bucket("forbidden");
        let cache = MetadataCache::new(source.clone(), 4).unwrap();

        assert!(cache.get("forbidden").await.unwrap_err().is_fatal());
        assert!(cache.get("forbidden").await.is_err());
        assert_info(&cache, 0, 2, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let source = Arc::new(MockAsperaSource::new());
        let err = MetadataCache::new(source, 0).unwrap_err();
        assert!(err.is_configuration());
    }
}
