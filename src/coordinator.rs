/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{error::TransferError, types::TransferId};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Callback run once if a transfer fails or is cancelled (e.g. abort a multipart upload)
pub(crate) type Cleanup = Box<dyn FnOnce() -> BoxFuture<Result<(), TransferError>> + Send>;

pub(crate) fn cleanup<F, Fut>(f: F) -> Cleanup
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<Result<(), TransferError>> { Box::pin(f()) })
}

/// Lifecycle of a transfer. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Created, no work submitted yet
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Done | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

struct CoordinatorState<T> {
    status: TransferStatus,
    outcome: Option<Result<T, TransferError>>,
    cleanups: Vec<Cleanup>,
    cleanup_errors: Vec<TransferError>,
    outstanding_parts: u64,
}

/// State holder for one logical transfer.
///
/// Shared by the driver, every part worker (through the cancellation token) and the
/// caller's [`TransferHandle`]. All transitions happen under one lock so that exactly one
/// transition into a terminal state wins no matter how many parts report at once.
pub(crate) struct TransferCoordinator<T> {
    id: TransferId,
    state: Mutex<CoordinatorState<T>>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl<T> fmt::Debug for TransferCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T> TransferCoordinator<T> {
    pub(crate) fn new(id: TransferId) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            id,
            state: Mutex::new(CoordinatorState {
                status: TransferStatus::Pending,
                outcome: None,
                cleanups: Vec::new(),
                cleanup_errors: Vec::new(),
                outstanding_parts: 0,
            }),
            cancel: CancellationToken::new(),
            finished,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState<T>> {
        // state is only mutated by the transitions below, none of which can panic midway
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> TransferId {
        self.id
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.lock().status
    }

    /// Token cancelled on every transition to `Failed` or `Cancelled`
    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Enter `InProgress` with `parts` outstanding. False if the transfer already ended.
    pub(crate) fn start(&self, parts: u64) -> bool {
        let mut state = self.lock();
        if state.status != TransferStatus::Pending {
            return false;
        }
        state.status = TransferStatus::InProgress;
        state.outstanding_parts = parts;
        tracing::debug!(transfer = %self.id, parts, "transfer started");
        true
    }

    pub(crate) fn outstanding_parts(&self) -> u64 {
        self.lock().outstanding_parts
    }

    /// Record a successful part; returns the number still outstanding
    pub(crate) fn part_succeeded(&self) -> u64 {
        let mut state = self.lock();
        state.outstanding_parts = state.outstanding_parts.saturating_sub(1);
        state.outstanding_parts
    }

    pub(crate) fn register_cleanup(&self, cleanup: Cleanup) {
        self.lock().cleanups.push(cleanup);
    }

    /// Record the first failure. False if the transfer already reached a terminal state.
    pub(crate) fn fail(&self, err: TransferError) -> bool {
        if err.is_cancelled() {
            return self.cancel();
        }
        self.transition(TransferStatus::Failed, Err(err))
    }

    /// Cancel the transfer. Idempotent; false if it already ended.
    pub(crate) fn cancel(&self) -> bool {
        self.transition(TransferStatus::Cancelled, Err(TransferError::Cancelled))
    }

    /// Record the assembled result. Only valid once every part succeeded.
    pub(crate) fn complete(&self, output: T) -> bool {
        debug_assert_eq!(0, self.outstanding_parts(), "completed with parts outstanding");
        self.transition(TransferStatus::Done, Ok(output))
    }

    fn transition(&self, to: TransferStatus, outcome: Result<T, TransferError>) -> bool {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                tracing::trace!(transfer = %self.id, status = ?state.status, ignored = ?to, "transfer already terminal");
                return false;
            }
            if let Err(err) = &outcome {
                tracing::debug!(transfer = %self.id, status = ?to, error = %err, "transfer terminated");
            } else {
                tracing::debug!(transfer = %self.id, "transfer done");
            }
            state.status = to;
            state.outcome = Some(outcome);
        }

        if to != TransferStatus::Done {
            self.cancel.cancel();
        }
        true
    }

    /// Run registered cleanups. Each runs at most once over the coordinator's lifetime.
    pub(crate) async fn run_cleanups(&self) {
        let cleanups = mem::take(&mut self.lock().cleanups);
        for cleanup in cleanups {
            if let Err(err) = cleanup().await {
                tracing::warn!(transfer = %self.id, error = %err, "transfer cleanup failed");
                self.lock().cleanup_errors.push(err);
            }
        }
    }

    /// Mark the outcome as observable by the caller
    pub(crate) fn finish(&self) {
        self.finished.send_replace(true);
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut finished = self.finished.subscribe();
        // the sender lives as long as `self`, so this only returns once finished
        let _ = finished.wait_for(|done| *done).await;
    }

    pub(crate) fn take_outcome(&self) -> Option<Result<T, TransferError>> {
        self.lock().outcome.take()
    }

    pub(crate) fn take_cleanup_errors(&self) -> Vec<TransferError> {
        mem::take(&mut self.lock().cleanup_errors)
    }
}

/// Caller's handle to a running transfer
pub struct TransferHandle<T> {
    coordinator: Arc<TransferCoordinator<T>>,
}

impl<T> fmt::Debug for TransferHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.coordinator.id())
            .field("status", &self.coordinator.status())
            .finish()
    }
}

impl<T> TransferHandle<T> {
    pub(crate) fn new(coordinator: Arc<TransferCoordinator<T>>) -> Self {
        Self { coordinator }
    }

    /// Handle of a transfer that failed before any work was submitted
    pub(crate) fn rejected(err: TransferError) -> Self {
        let coordinator = TransferCoordinator::new(TransferId::next());
        coordinator.fail(err);
        coordinator.finish();
        Self::new(coordinator)
    }

    pub fn id(&self) -> TransferId {
        self.coordinator.id()
    }

    /// Current status. A terminal status may be visible slightly before
    /// cleanup has run; use [`is_done`](Self::is_done) to poll for the final outcome.
    pub fn status(&self) -> TransferStatus {
        self.coordinator.status()
    }

    /// Cancel the transfer. Queued parts are dropped, parts waiting for a worker slot,
    /// bandwidth, or I/O are released and registered cleanup runs. Idempotent.
    pub fn cancel(&self) {
        if self.coordinator.cancel() {
            tracing::debug!(transfer = %self.coordinator.id(), "transfer cancelled by caller");
        }
    }

    /// True once the outcome is available (non-blocking)
    pub fn is_done(&self) -> bool {
        self.coordinator.is_finished()
    }

    /// Wait until the transfer reached a terminal state and cleanup has run
    pub async fn wait(&self) {
        self.coordinator.wait().await
    }

    /// Errors raised by cleanup callbacks (e.g. a failed abort). Drains the list.
    pub fn cleanup_errors(&self) -> Vec<TransferError> {
        self.coordinator.take_cleanup_errors()
    }

    /// Wait for the transfer to finish and return its result or first recorded error
    pub async fn join(self) -> Result<T, TransferError> {
        self.coordinator.wait().await;
        self.coordinator.take_outcome().unwrap_or_else(|| {
            Err(TransferError::Fatal {
                context: format!("{} finished without an outcome", self.coordinator.id()),
                source: "outcome already taken".into(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{cleanup, TransferCoordinator, TransferHandle, TransferStatus};
    use crate::{
        error::{self, TransferError},
        types::TransferId,
    };

    #[test]
    fn test_terminal_state_is_sticky() {
        let coordinator = TransferCoordinator::<u32>::new(TransferId::next());
        assert_eq!(TransferStatus::Pending, coordinator.status());
        assert!(coordinator.start(2));
        assert!(!coordinator.start(2));
        assert_eq!(TransferStatus::InProgress, coordinator.status());

        assert!(coordinator.fail(error::fatal("part 1 failed", "boom")));
        assert!(!coordinator.fail(error::fatal("part 2 failed", "boom")));
        assert!(!coordinator.cancel());
        assert_eq!(TransferStatus::Failed, coordinator.status());
        assert!(coordinator.cancellation_token().is_cancelled());

        let err = coordinator.take_outcome().unwrap().unwrap_err();
        assert_eq!("part 1 failed", err.to_string());
    }

    #[test]
    fn test_cancel_before_start() {
        let coordinator = TransferCoordinator::<()>::new(TransferId::next());
        assert!(coordinator.cancel());
        assert!(!coordinator.start(1));
        assert_eq!(TransferStatus::Cancelled, coordinator.status());
    }

    #[test]
    fn test_done_does_not_cancel_token() {
        let coordinator = TransferCoordinator::new(TransferId::next());
        assert!(coordinator.start(1));
        assert_eq!(0, coordinator.part_succeeded());
        assert!(coordinator.complete(5));
        assert!(!coordinator.cancel());
        assert!(!coordinator.cancellation_token().is_cancelled());
        assert_eq!(5, coordinator.take_outcome().unwrap().unwrap());
    }

    #[test]
    fn test_concurrent_failures_one_transition() {
        let coordinator = TransferCoordinator::<()>::new(TransferId::next());
        coordinator.start(16);
        let wins = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..16)
            .map(|i| {
                let coordinator = coordinator.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if coordinator.fail(error::fatal(format!("part {i} failed"), "boom")) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(1, wins.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanups_run_once_and_errors_are_kept() {
        let coordinator = TransferCoordinator::<()>::new(TransferId::next());
        let runs = Arc::new(AtomicUsize::new(0));
        for fail in [false, true] {
            let runs = runs.clone();
            coordinator.register_cleanup(cleanup(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(error::fatal("abort failed", "503"))
                } else {
                    Ok(())
                }
            }));
        }
        coordinator.start(1);
        coordinator.fail(error::fatal("part 1 failed", "boom"));
        coordinator.run_cleanups().await;
        coordinator.run_cleanups().await;
        coordinator.finish();
        assert_eq!(2, runs.load(Ordering::SeqCst));

        let handle = TransferHandle::new(coordinator);
        assert!(handle.is_done());
        assert_eq!(1, handle.cleanup_errors().len());
        let err = handle.join().await.unwrap_err();
        assert_eq!("part 1 failed", err.to_string());
    }

    #[tokio::test]
    async fn test_cancelled_error_from_fail_is_cancellation() {
        let coordinator = TransferCoordinator::<()>::new(TransferId::next());
        coordinator.start(1);
        coordinator.fail(TransferError::Cancelled);
        assert_eq!(TransferStatus::Cancelled, coordinator.status());
    }

    #[tokio::test]
    async fn test_rejected_handle_is_done_with_error() {
        let handle = TransferHandle::<u32>::rejected(error::invalid_config("concurrency must be positive"));
        assert!(handle.is_done());
        assert_eq!(TransferStatus::Failed, handle.status());
        assert!(handle.join().await.unwrap_err().is_configuration());
    }
}
