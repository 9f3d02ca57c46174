/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{future::Future, time::Duration};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};

use crate::error::{self, TransferError};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Bounded retry of transient failures with jittered exponential backoff.
///
/// Only [`TransferError::TransientIo`] is retried. Once the budget is spent the last
/// transient error is escalated to [`TransferError::Fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the first retry; later retries double it
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // ExponentialBackoff::from_millis(2) yields factor * 2^n milliseconds
        let factor = (self.base_delay.as_millis() / 2).clamp(1, u64::MAX as u128) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter)
            .take(self.max_retries as usize)
    }

    pub(crate) async fn retry<T, A, F>(&self, what: &str, action: A) -> Result<T, TransferError>
    where
        A: FnMut() -> F,
        F: Future<Output = Result<T, TransferError>>,
    {
        let max_retries = self.max_retries;
        let mut failures = 0u32;
        let result = RetryIf::start(self.strategy(), action, |err: &TransferError| {
            failures += 1;
            let retry = err.is_transient() && failures <= max_retries;
            if retry {
                tracing::debug!(attempt = failures, max_retries, error = %err, "{} failed; retrying", what);
            }
            retry
        })
        .await;

        result.map_err(|err| {
            error::exhausted(
                format!("{} failed after {} attempt(s)", what, failures),
                err,
            )
        })
    }
}
