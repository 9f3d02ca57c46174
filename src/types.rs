use std::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::config::TransferSettings;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one logical transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) fn next() -> Self {
        TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Direction of a transfer relative to the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Immutable description of one logical transfer.
///
/// Created by a manager once the transfer size is known and handed to the
/// [`TaskScheduler`](crate::scheduler::TaskScheduler), which decomposes it into parts.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub(crate) id: TransferId,
    pub(crate) direction: Direction,
    pub(crate) bucket: String,
    pub(crate) key: String,
    // bytes of the object (or upload source) covered by this transfer
    pub(crate) range: Range<u64>,
    pub(crate) multipart: bool,
    pub(crate) settings: TransferSettings,
}

impl TransferRequest {
    pub(crate) fn new(
        id: TransferId,
        direction: Direction,
        bucket: impl Into<String>,
        key: impl Into<String>,
        range: Range<u64>,
        multipart: bool,
        settings: TransferSettings,
    ) -> Self {
        Self {
            id,
            direction,
            bucket: bucket.into(),
            key: key.into(),
            range,
            multipart,
            settings,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Total number of bytes moved by this transfer
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }
}

/// One unit of work of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    // owning transfer, kept as an id rather than a reference to the coordinator
    pub(crate) transfer: TransferId,
    // 1-based, contiguous
    pub(crate) part_number: u64,
    pub(crate) range: Range<u64>,
}

impl Part {
    pub fn transfer(&self) -> TransferId {
        self.transfer
    }

    pub fn part_number(&self) -> u64 {
        self.part_number
    }

    pub fn range(&self) -> &Range<u64> {
        &self.range
    }

    /// Size of this part in bytes
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}
