/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    bandwidth::BandwidthLimiter,
    chunk::ChunkPolicy,
    config::Config,
    coordinator::{Cleanup, TransferCoordinator, TransferHandle, TransferStatus},
    error::{self, TransferError},
    retry::RetryPolicy,
    types::{Part, TransferId, TransferRequest},
};

/// The I/O side of one transfer, driven part by part by the [`TaskScheduler`].
#[async_trait]
pub(crate) trait TransferOperation: Send + Sync + 'static {
    type PartOutput: Send + 'static;
    type Output: Send + 'static;

    /// Runs once before any part is started. A returned cleanup runs if the transfer
    /// later fails or is cancelled.
    async fn initiate(&self) -> Result<Option<Cleanup>, TransferError> {
        Ok(None)
    }

    /// Wait until the operation can take `part`. Parts are handed to workers in order
    /// and only once this returns, which bounds how far ahead of the slowest part a
    /// transfer may run.
    async fn ready(&self, _part: &Part) {}

    /// Move the bytes of one part. Called concurrently and possibly more than once per
    /// part when earlier attempts failed with a transient error.
    async fn transfer_part(&self, part: &Part) -> Result<Self::PartOutput, TransferError>;

    /// Consume the output of a successful part. Called from the driver only, in
    /// completion order.
    async fn accept(&self, part: &Part, output: Self::PartOutput) -> Result<(), TransferError>;

    /// Assemble the result once every part has been accepted
    async fn finalize(&self) -> Result<Self::Output, TransferError>;
}

/// Bounded worker pool shared by every transfer submitted to it.
///
/// The pool size is the global ceiling on parts in flight; each transfer additionally
/// runs at most its configured concurrency worth of workers. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    bandwidth: BandwidthLimiter,
    policy: ChunkPolicy,
}

impl TaskScheduler {
    pub fn new(
        max_concurrency: usize,
        bandwidth: BandwidthLimiter,
        policy: ChunkPolicy,
    ) -> Result<Self, TransferError> {
        if max_concurrency == 0 {
            return Err(error::invalid_config("max_concurrency must be at least 1"));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            bandwidth,
            policy,
        })
    }

    /// Scheduler with the pool size, bandwidth limit and part limits of `config`
    pub fn from_config(config: &Config) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency())),
            max_concurrency: config.max_concurrency(),
            bandwidth: BandwidthLimiter::new(config.max_bandwidth_bytes_per_sec()),
            policy: *config.chunk_policy(),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Worker slots currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn bandwidth(&self) -> &BandwidthLimiter {
        &self.bandwidth
    }

    pub fn chunk_policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    /// Start `request` in the background and return a handle to it
    #[cfg(test)]
    pub(crate) fn submit<O>(&self, request: TransferRequest, operation: O) -> TransferHandle<O::Output>
    where
        O: TransferOperation,
    {
        let (id, timeout) = (request.id, request.settings.timeout);
        self.submit_with(id, timeout, async move { Ok((request, operation)) })
    }

    /// Start a transfer whose request is only known once `prepare` has run (e.g. after
    /// discovering the object size). `prepare` counts against the timeout and is
    /// abandoned if the transfer is cancelled first.
    pub(crate) fn submit_with<O, F>(
        &self,
        id: TransferId,
        timeout: Option<Duration>,
        prepare: F,
    ) -> TransferHandle<O::Output>
    where
        O: TransferOperation,
        F: Future<Output = Result<(TransferRequest, O), TransferError>> + Send + 'static,
    {
        let scheduler = self.clone();
        spawn_transfer(id, timeout, move |transfer| async move {
            let cancel = transfer.cancellation_token().clone();
            let prepared = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                prepared = prepare => Some(prepared),
            };
            match prepared {
                Some(Ok((request, operation))) => {
                    scheduler.run(transfer, request, Arc::new(operation)).await
                }
                Some(Err(err)) => {
                    transfer.fail(err);
                    transfer.finish();
                }
                None => transfer.finish(),
            }
        })
    }

    // Drive `request` to a terminal state on `coordinator`, run cleanups if it did not
    // succeed and make the outcome observable.
    async fn run<O>(
        self,
        coordinator: Arc<TransferCoordinator<O::Output>>,
        request: TransferRequest,
        operation: Arc<O>,
    ) where
        O: TransferOperation,
    {
        self.drive(&coordinator, &request, operation).await;
        if matches!(
            coordinator.status(),
            TransferStatus::Failed | TransferStatus::Cancelled
        ) {
            coordinator.run_cleanups().await;
        }
        coordinator.finish();
    }

    async fn drive<O>(
        &self,
        coordinator: &Arc<TransferCoordinator<O::Output>>,
        request: &TransferRequest,
        operation: Arc<O>,
    ) where
        O: TransferOperation,
    {
        let parts = match self.plan(request) {
            Ok(parts) => parts,
            Err(err) => {
                coordinator.fail(err);
                return;
            }
        };

        if !coordinator.start(parts.len() as u64) {
            tracing::debug!(transfer = %request.id, "transfer ended before any part was started");
            return;
        }

        // not raced against cancellation so that a created upload always gets its cleanup
        match operation.initiate().await {
            Ok(Some(cleanup)) => coordinator.register_cleanup(cleanup),
            Ok(None) => {}
            Err(err) => {
                coordinator.fail(err);
                return;
            }
        }
        if coordinator.status().is_terminal() {
            return;
        }

        self.transfer_parts(coordinator, request, &operation, parts)
            .await;

        if coordinator.status() != TransferStatus::InProgress {
            return;
        }
        let outstanding = coordinator.outstanding_parts();
        if outstanding > 0 {
            coordinator.fail(error::fatal(
                format!("{} stopped with {} part(s) outstanding", request.id, outstanding),
                "part worker exited before reporting a result",
            ));
            return;
        }

        let cancel = coordinator.cancellation_token().clone();
        let finalized = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = operation.finalize() => result,
        };
        match finalized {
            Ok(output) => {
                coordinator.complete(output);
            }
            Err(err) => {
                coordinator.fail(err);
            }
        }
    }

    fn plan(&self, request: &TransferRequest) -> Result<Vec<Part>, TransferError> {
        if !request.multipart {
            return Ok(vec![Part {
                transfer: request.id,
                part_number: 1,
                range: request.range.clone(),
            }]);
        }

        let plan = self
            .policy
            .plan(request.size(), request.settings.part_size_hint)?;
        tracing::debug!(
            transfer = %request.id,
            part_size = plan.part_size(),
            parts = plan.part_count(),
            "planned multipart {}",
            request.direction
        );
        Ok(plan.parts(request.id, request.range.start))
    }

    async fn transfer_parts<O>(
        &self,
        coordinator: &TransferCoordinator<O::Output>,
        request: &TransferRequest,
        operation: &Arc<O>,
        parts: Vec<Part>,
    ) where
        O: TransferOperation,
    {
        let cancel = coordinator.cancellation_token();
        let workers = request.settings.concurrency.min(parts.len()).max(1);
        let (work_tx, work_rx) = async_channel::bounded(workers);
        let (comp_tx, mut comp_rx) = mpsc::channel(workers);

        tokio::spawn(distribute_work(operation.clone(), parts, work_tx, cancel.clone()));

        // spin up workers
        for _ in 0..workers {
            let worker = PartWorker {
                operation: operation.clone(),
                permits: self.permits.clone(),
                bandwidth: self.bandwidth.clone(),
                retry: request.settings.retry,
                cancel: cancel.clone(),
            };
            tokio::spawn(worker.run(work_rx.clone(), comp_tx.clone()));
        }
        drop(work_rx);
        drop(comp_tx);

        // returns once every worker has exited
        while let Some((part, result)) = comp_rx.recv().await {
            if coordinator.status().is_terminal() {
                tracing::trace!(transfer = %part.transfer, part = part.part_number, "discarding part result");
                continue;
            }

            let result = match result {
                Ok(output) => operation.accept(&part, output).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    let remaining = coordinator.part_succeeded();
                    tracing::trace!(transfer = %part.transfer, part = part.part_number, remaining, "part completed");
                }
                Err(err) => {
                    coordinator.fail(err);
                }
            }
        }
    }
}

/// Create the coordinator of a new transfer, arm its timeout and spawn `body` to drive
/// it. `body` must eventually call `finish` on the coordinator.
pub(crate) fn spawn_transfer<T, F, Fut>(id: TransferId, timeout: Option<Duration>, body: F) -> TransferHandle<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<TransferCoordinator<T>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let coordinator = TransferCoordinator::new(id);
    watch_timeout(&coordinator, timeout);
    tokio::spawn(body(coordinator.clone()));
    TransferHandle::new(coordinator)
}

// Cancel the transfer if it has not finished after `timeout`
fn watch_timeout<T>(coordinator: &Arc<TransferCoordinator<T>>, timeout: Option<Duration>)
where
    T: Send + 'static,
{
    let Some(timeout) = timeout else {
        return;
    };
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = coordinator.wait() => {}
            _ = tokio::time::sleep(timeout) => {
                if coordinator.cancel() {
                    tracing::debug!(transfer = %coordinator.id(), ?timeout, "transfer timed out");
                }
            }
        }
    });
}

async fn distribute_work<O: TransferOperation>(
    operation: Arc<O>,
    parts: Vec<Part>,
    tx: async_channel::Sender<Part>,
    cancel: CancellationToken,
) {
    for part in parts {
        tracing::trace!(transfer = %part.transfer, part = part.part_number, size = part.size(), "distributing part");
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = async {
                operation.ready(&part).await;
                tx.send(part).await
            } => sent.is_ok(),
        };
        if !sent {
            tracing::trace!("transfer ended, remaining parts dropped");
            break;
        }
    }

    tracing::trace!("work fully distributed");
    tx.close();
}

type PartResult<O> = (
    Part,
    Result<<O as TransferOperation>::PartOutput, TransferError>,
);

struct PartWorker<O> {
    operation: Arc<O>,
    permits: Arc<Semaphore>,
    bandwidth: BandwidthLimiter,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<O: TransferOperation> PartWorker<O> {
    // Processes parts from the `parts` channel and sends the result back on `completed`
    async fn run(self, parts: async_channel::Receiver<Part>, completed: mpsc::Sender<PartResult<O>>) {
        while let Ok(part) = parts.recv().await {
            if self.cancel.is_cancelled() {
                tracing::trace!(transfer = %part.transfer, "transfer ended, dropping queued parts");
                break;
            }
            let part_number = part.part_number;
            tracing::trace!("worker recv'd part {}", part_number);
            let result = self.transfer(&part).await;
            if completed.send((part, result)).await.is_err() {
                tracing::debug!("part worker send failed");
                return;
            }
            tracing::trace!("worker completed part {}", part_number);
        }
        tracing::trace!("part channel closed, worker finished");
    }

    // Each suspension point (worker slot, bandwidth, I/O) is raced against cancellation
    async fn transfer(&self, part: &Part) -> Result<O::PartOutput, TransferError> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|e| error::fatal("worker pool closed", e))?
            }
        };

        let what = format!("{} part {}", part.transfer, part.part_number);
        let (operation, bandwidth, cancel) = (&*self.operation, &self.bandwidth, &self.cancel);
        let attempts = self.retry.retry(&what, move || async move {
            bandwidth.consume(part.size(), cancel).await?;
            operation.transfer_part(part).await
        });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = attempts => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{TaskScheduler, TransferOperation};
    use crate::{
        bandwidth::BandwidthLimiter,
        chunk::ChunkPolicy,
        config::TransferSettings,
        coordinator::{cleanup, Cleanup, TransferStatus},
        error::{self, TransferError},
        retry::RetryPolicy,
        types::{Direction, Part, TransferId, TransferRequest},
    };

    const PART_SIZE: u64 = 10;

    #[derive(Debug, Default)]
    struct Counters {
        initiated: AtomicUsize,
        parts_run: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        finalized: AtomicUsize,
        accepted_at_finalize: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[derive(Debug, Clone, Copy)]
    enum FailMode {
        Fatal,
        // fail this many attempts, then succeed
        Transient(u32),
    }

    struct TestOperation {
        counters: Arc<Counters>,
        accepted: Mutex<Vec<u64>>,
        attempts: Mutex<HashMap<u64, u32>>,
        fail: Option<(u64, FailMode)>,
        delay: Duration,
        fail_finalize: bool,
        fail_cleanup: bool,
    }

    impl TestOperation {
        fn new(counters: &Arc<Counters>) -> Self {
            Self {
                counters: counters.clone(),
                accepted: Mutex::new(Vec::new()),
                attempts: Mutex::new(HashMap::new()),
                fail: None,
                delay: Duration::ZERO,
                fail_finalize: false,
                fail_cleanup: false,
            }
        }

        fn failing(mut self, part_number: u64, mode: FailMode) -> Self {
            self.fail = Some((part_number, mode));
            self
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl TransferOperation for TestOperation {
        type PartOutput = u64;
        type Output = usize;

        async fn initiate(&self) -> Result<Option<Cleanup>, TransferError> {
            self.counters.initiated.fetch_add(1, Ordering::SeqCst);
            let counters = self.counters.clone();
            let fail_cleanup = self.fail_cleanup;
            Ok(Some(cleanup(move || async move {
                counters.cleanups.fetch_add(1, Ordering::SeqCst);
                if fail_cleanup {
                    Err(error::fatal("abort multipart upload failed", "503"))
                } else {
                    Ok(())
                }
            })))
        }

        async fn transfer_part(&self, part: &Part) -> Result<u64, TransferError> {
            self.counters.parts_run.fetch_add(1, Ordering::SeqCst);
            let in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let attempt = attempts.entry(part.part_number).or_insert(0);
                *attempt += 1;
                *attempt
            };
            match self.fail {
                Some((n, FailMode::Fatal)) if n == part.part_number => {
                    Err(error::fatal(format!("part {n} rejected"), "400 bad request"))
                }
                Some((n, FailMode::Transient(times))) if n == part.part_number && attempt <= times => {
                    Err(error::transient("503 slow down"))
                }
                _ => Ok(part.size()),
            }
        }

        async fn accept(&self, part: &Part, output: u64) -> Result<(), TransferError> {
            assert_eq!(part.size(), output);
            self.accepted.lock().unwrap().push(part.part_number);
            Ok(())
        }

        async fn finalize(&self) -> Result<usize, TransferError> {
            self.counters.finalized.fetch_add(1, Ordering::SeqCst);
            let accepted = self.accepted.lock().unwrap().len();
            self.counters
                .accepted_at_finalize
                .store(accepted, Ordering::SeqCst);
            if self.fail_finalize {
                return Err(error::fatal("complete multipart upload failed", "500"));
            }
            Ok(accepted)
        }
    }

    fn scheduler(max_concurrency: usize) -> TaskScheduler {
        TaskScheduler::new(
            max_concurrency,
            BandwidthLimiter::unlimited(),
            ChunkPolicy::new(1, 10_000, 1 << 40).unwrap(),
        )
        .unwrap()
    }

    fn settings(concurrency: usize, max_retries: u32) -> TransferSettings {
        TransferSettings {
            concurrency,
            part_size_hint: PART_SIZE,
            retry: RetryPolicy::new(max_retries, Duration::from_millis(2)),
            timeout: None,
        }
    }

    fn request(parts: u64, settings: TransferSettings) -> TransferRequest {
        TransferRequest::new(
            TransferId::next(),
            Direction::Upload,
            "bucket",
            "key",
            0..parts * PART_SIZE,
            true,
            settings,
        )
    }

    #[tokio::test]
    async fn test_all_parts_succeed_then_finalize_once() {
        let counters = Arc::new(Counters::default());
        let handle = scheduler(4).submit(request(8, settings(3, 0)), TestOperation::new(&counters));
        assert_eq!(8, handle.join().await.unwrap());
        assert_eq!(1, counters.finalized.load(Ordering::SeqCst));
        assert_eq!(8, counters.accepted_at_finalize.load(Ordering::SeqCst));
        assert_eq!(8, counters.parts_run.load(Ordering::SeqCst));
        assert_eq!(0, counters.cleanups.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_single_part_request_covers_whole_range() {
        let counters = Arc::new(Counters::default());
        let mut req = request(3, settings(3, 0));
        req.multipart = false;
        let handle = scheduler(4).submit(req, TestOperation::new(&counters));
        assert_eq!(1, handle.join().await.unwrap());
        assert_eq!(1, counters.parts_run.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_permanent_part_failure_aborts_once() {
        let counters = Arc::new(Counters::default());
        let op = TestOperation::new(&counters).failing(3, FailMode::Fatal);
        let handle = scheduler(4).submit(request(10, settings(2, 3)), op);
        handle.wait().await;
        assert_eq!(TransferStatus::Failed, handle.status());
        let err = handle.join().await.unwrap_err();
        assert!(err.is_fatal(), "{err:?}");
        assert_eq!("part 3 rejected", err.to_string());
        assert_eq!(1, counters.cleanups.load(Ordering::SeqCst));
        assert_eq!(0, counters.finalized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_queued_parts_dropped_after_failure() {
        let counters = Arc::new(Counters::default());
        let op = TestOperation::new(&counters).failing(1, FailMode::Fatal);
        let handle = scheduler(4).submit(request(50, settings(1, 0)), op);
        assert!(handle.join().await.unwrap_err().is_fatal());
        // the failed part plus at most the one already handed to the single worker
        let parts_run = counters.parts_run.load(Ordering::SeqCst);
        assert!(parts_run <= 2, "{parts_run} parts ran");
        assert_eq!(0, counters.finalized.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_transfer_concurrency_below_global_ceiling() {
        let counters = Arc::new(Counters::default());
        let scheduler = scheduler(8);
        let op = TestOperation::new(&counters).delay(Duration::from_millis(10));
        let handle = scheduler.submit(request(12, settings(2, 0)), op);
        assert_eq!(12, handle.join().await.unwrap());
        assert_eq!(2, counters.max_in_flight.load(Ordering::SeqCst));
        assert_eq!(8, scheduler.available_permits());
    }

    #[tokio::test]
    async fn test_prepare_failure_fails_transfer() {
        let counters = Arc::new(Counters::default());
        let handle = scheduler(2).submit_with(TransferId::next(), None, async {
            Err::<(TransferRequest, TestOperation), _>(error::fatal("head object failed", "404"))
        });
        let err = handle.join().await.unwrap_err();
        assert_eq!("head object failed", err.to_string());
        assert_eq!(0, counters.initiated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_prepare() {
        let counters = Arc::new(Counters::default());
        let op = TestOperation::new(&counters);
        let handle = scheduler(2).submit_with(TransferId::next(), Some(Duration::from_secs(1)), async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok((request(2, settings(2, 0)), op))
        });
        assert!(handle.join().await.unwrap_err().is_cancelled());
        assert_eq!(0, counters.initiated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_part_failures_are_retried() {
        let counters = Arc::new(Counters::default());
        let op = TestOperation::new(&counters).failing(2, FailMode::Transient(2));
        let handle = scheduler(4).submit(request(4, settings(4, 3)), op);
        assert_eq!(4, handle.join().await.unwrap());
        // two failed attempts of part 2 plus one success for each part
        assert_eq!(6, counters.parts_run.load(Ordering::SeqCst));
        assert_eq!(0, counters.cleanups.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_fails_transfer() {
        let counters = Arc::new(Counters::default());
        let op = TestOperation::new(&counters).failing(1, FailMode::Transient(u32::MAX));
        let handle = scheduler(4).submit(request(4, settings(1, 2)), op);
        let err = handle.join().await.unwrap_err();
        assert!(err.is_fatal(), "{err:?}");
        let source = std::error::Error::source(&err).unwrap().to_string();
        assert!(source.contains("slow down"), "{source}");
        assert_eq!(1, counters.cleanups.load(Ordering::SeqCst));
        assert_eq!(0, counters.finalized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_no_parts() {
        let counters = Arc::new(Counters::default());
        let handle = scheduler(4).submit(request(5, settings(4, 0)), TestOperation::new(&counters));
        handle.cancel();
        handle.cancel();
        let err = handle.join().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(0, counters.initiated.load(Ordering::SeqCst));
        assert_eq!(0, counters.parts_run.load(Ordering::SeqCst));
        assert_eq!(0, counters.finalized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_releases_parts_waiting_for_bandwidth() {
        let counters = Arc::new(Counters::default());
        let scheduler = TaskScheduler::new(
            4,
            BandwidthLimiter::new(Some(1)),
            ChunkPolicy::new(1, 10_000, 1 << 40).unwrap(),
        )
        .unwrap();
        let handle = scheduler.submit(request(4, settings(4, 0)), TestOperation::new(&counters));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(TransferStatus::InProgress, handle.status());
        handle.cancel();

        let err = handle.join().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(0, counters.parts_run.load(Ordering::SeqCst));
        // multipart state created by initiate is cleaned up
        assert_eq!(1, counters.cleanups.load(Ordering::SeqCst));
        assert_eq!(4, scheduler.available_permits());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_concurrency_ceiling_shared_by_transfers() {
        let counters = Arc::new(Counters::default());
        let scheduler = scheduler(2);
        let a = scheduler.submit(
            request(6, settings(4, 0)),
            TestOperation::new(&counters).delay(Duration::from_millis(10)),
        );
        let b = scheduler.submit(
            request(6, settings(4, 0)),
            TestOperation::new(&counters).delay(Duration::from_millis(10)),
        );
        assert_eq!(6, a.join().await.unwrap());
        assert_eq!(6, b.join().await.unwrap());
        assert!(counters.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(12, counters.parts_run.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_affect_unrelated_transfer() {
        let scheduler = scheduler(3);
        let failing = Arc::new(Counters::default());
        let healthy = Arc::new(Counters::default());
        let a = scheduler.submit(
            request(6, settings(3, 0)),
            TestOperation::new(&failing)
                .failing(1, FailMode::Fatal)
                .delay(Duration::from_millis(5)),
        );
        let b = scheduler.submit(
            request(6, settings(3, 0)),
            TestOperation::new(&healthy).delay(Duration::from_millis(5)),
        );

        assert!(a.join().await.unwrap_err().is_fatal());
        b.wait().await;
        assert_eq!(TransferStatus::Done, b.status());
        assert_eq!(6, b.join().await.unwrap());
        assert_eq!(0, healthy.cleanups.load(Ordering::SeqCst));
        assert_eq!(1, failing.cleanups.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_transfer() {
        let counters = Arc::new(Counters::default());
        let mut settings = settings(2, 0);
        settings.timeout = Some(Duration::from_secs(1));
        let op = TestOperation::new(&counters).delay(Duration::from_secs(10));
        let handle = scheduler(2).submit(request(4, settings), op);
        let err = handle.join().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(0, counters.finalized.load(Ordering::SeqCst));
        assert_eq!(1, counters.cleanups.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finalize_failure_fails_transfer() {
        let counters = Arc::new(Counters::default());
        let mut op = TestOperation::new(&counters);
        op.fail_finalize = true;
        let handle = scheduler(2).submit(request(3, settings(2, 0)), op);
        let err = handle.join().await.unwrap_err();
        assert_eq!("complete multipart upload failed", err.to_string());
        assert_eq!(1, counters.finalized.load(Ordering::SeqCst));
        assert_eq!(1, counters.cleanups.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_mask_original_error() {
        let counters = Arc::new(Counters::default());
        let mut op = TestOperation::new(&counters).failing(1, FailMode::Fatal);
        op.fail_cleanup = true;
        let handle = scheduler(2).submit(request(3, settings(1, 0)), op);
        handle.wait().await;
        let cleanup_errors = handle.cleanup_errors();
        assert_eq!(1, cleanup_errors.len());
        assert_eq!("abort multipart upload failed", cleanup_errors[0].to_string());
        let err = handle.join().await.unwrap_err();
        assert_eq!("part 1 rejected", err.to_string());
    }

    #[tokio::test]
    async fn test_plan_error_fails_before_start() {
        let counters = Arc::new(Counters::default());
        let scheduler = TaskScheduler::new(
            2,
            BandwidthLimiter::unlimited(),
            ChunkPolicy::new(1, 2, 10).unwrap(),
        )
        .unwrap();
        // 100 bytes in at most 2 parts of at most 10 bytes cannot be planned
        let handle = scheduler.submit(request(10, settings(2, 0)), TestOperation::new(&counters));
        let err = handle.join().await.unwrap_err();
        assert!(err.is_configuration(), "{err:?}");
        assert_eq!(0, counters.initiated.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = TaskScheduler::new(0, BandwidthLimiter::unlimited(), ChunkPolicy::default())
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
