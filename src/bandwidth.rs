/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{fmt, num::NonZeroU32, sync::Arc};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{self, TransferError};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Aggregate throughput throttle shared by every part of every transfer.
///
/// A token bucket holding up to one second worth of bytes that refills continuously at
/// the configured rate. Waiters queue on a fair mutex, so budget is handed out roughly in
/// arrival order. An unlimited limiter never blocks.
#[derive(Clone, Default)]
pub struct BandwidthLimiter {
    bucket: Option<Arc<Bucket>>,
}

struct Bucket {
    limiter: DirectRateLimiter,
    // burst size, also the refill per second
    capacity: NonZeroU32,
    // tokio's mutex is FIFO, holding it across the wait queues later callers
    queue: Mutex<()>,
}

impl fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_sec", &self.bytes_per_sec())
            .finish()
    }
}

impl BandwidthLimiter {
    /// A limiter that never throttles
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Limit throughput to `max_bytes_per_sec`. `None` or zero means unlimited. Rates
    /// above `u32::MAX` bytes per second are capped there.
    pub fn new(max_bytes_per_sec: Option<u64>) -> Self {
        let rate = max_bytes_per_sec
            .map(|rate| u32::try_from(rate).unwrap_or(u32::MAX))
            .and_then(NonZeroU32::new);
        let Some(rate) = rate else {
            return Self::unlimited();
        };
        Self {
            bucket: Some(Arc::new(Bucket {
                limiter: RateLimiter::direct(Quota::per_second(rate)),
                capacity: rate,
                queue: Mutex::new(()),
            })),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn bytes_per_sec(&self) -> Option<u64> {
        self.bucket.as_ref().map(|b| u64::from(b.capacity.get()))
    }

    /// Wait until `bytes` of budget are available and debit them.
    ///
    /// Resolves to [`TransferError::Cancelled`] if `cancel` fires first; budget debited
    /// before cancellation is not returned to the bucket.
    pub async fn consume(&self, bytes: u64, cancel: &CancellationToken) -> Result<(), TransferError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            debited = debit(bucket, bytes) => debited,
        }
    }
}

async fn debit(bucket: &Bucket, bytes: u64) -> Result<(), TransferError> {
    let _turn = bucket.queue.lock().await;
    let mut remaining = bytes;
    while remaining > 0 {
        // requests larger than the bucket are taken in capacity-sized slices
        let slice = remaining.min(u64::from(bucket.capacity.get()));
        let Some(cells) = NonZeroU32::new(slice as u32) else {
            break;
        };
        tracing::trace!(slice, remaining, "waiting for bandwidth budget");
        bucket
            .limiter
            .until_n_ready(cells)
            .await
            .map_err(|e| error::fatal(format!("debit of {} bytes failed", slice), e))?;
        remaining -= slice;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use super::BandwidthLimiter;

    #[tokio::test]
    async fn test_bucket_starts_full() {
        let limiter = BandwidthLimiter::new(Some(1000));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.consume(1000, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_consuming_twice_the_rate_takes_a_second() {
        let limiter = BandwidthLimiter::new(Some(1000));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.consume(2000, &cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(950), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1800), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_limit_shared_across_callers() {
        let limiter = BandwidthLimiter::new(Some(1000));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                limiter.consume(500, &cancel).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // 2000 bytes with a full 1000 byte bucket needs one second of refill
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(950), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1800), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = BandwidthLimiter::new(None);
        assert!(!limiter.is_limited());
        let cancel = CancellationToken::new();
        cancel.cancel();
        // no budget to wait for, so even a cancelled caller passes straight through
        limiter.consume(u64::MAX, &cancel).await.unwrap();
        assert!(!BandwidthLimiter::new(Some(0)).is_limited());
        assert_eq!(Some(u32::MAX as u64), BandwidthLimiter::new(Some(u64::MAX)).bytes_per_sec());
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_cancellable() {
        let limiter = BandwidthLimiter::new(Some(10));
        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.consume(10_000, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // the queue is released for other callers
        let other = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), limiter.consume(5, &other))
            .await
            .expect("not blocked by cancelled waiter")
            .unwrap();
    }
}
