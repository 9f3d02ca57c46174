use std::{ops::RangeInclusive, str::FromStr};

use crate::{
    download::DownloadRequest,
    error::TransferError,
    header::{ByteRange, Range},
    object_meta::ObjectMeta,
    retry::RetryPolicy,
    store::ObjectStore,
};

/// Result of initial object discovery
#[derive(Debug, Clone)]
pub(crate) struct DiscoverResult {
    // bytes to download, none if the request selects nothing (empty object, "bytes=-0")
    pub(crate) remaining: Option<RangeInclusive<u64>>,
    pub(crate) object_meta: ObjectMeta,
}

impl DiscoverResult {
    /// Remaining bytes as a half-open range, `0..0` when nothing is left
    pub(crate) fn byte_range(&self) -> std::ops::Range<u64> {
        match &self.remaining {
            Some(range) => *range.start()..*range.end() + 1,
            None => 0..0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum DiscoverObjectSizeStrategy {
    // Send a `HeadObject` request and download the whole object
    HeadObject,
    // Send a `HeadObject` request and resolve the caller's range against the object size
    HeadObjectInRange(ByteRange),
}

impl DiscoverObjectSizeStrategy {
    fn from_request(request: &DownloadRequest) -> Result<DiscoverObjectSizeStrategy, TransferError> {
        let strategy = match request.range_header() {
            Some(h) => DiscoverObjectSizeStrategy::HeadObjectInRange(Range::from_str(h)?.0),
            None => DiscoverObjectSizeStrategy::HeadObject,
        };
        Ok(strategy)
    }
}

/// Discover the object size and metadata and the byte range to download.
///
/// The `HeadObject` request is retried under `retry` like any part request.
pub(crate) async fn discover_obj_size(
    store: &dyn ObjectStore,
    request: &DownloadRequest,
    retry: RetryPolicy,
) -> Result<DiscoverResult, TransferError> {
    // validate the range header before any request is made
    let strategy = DiscoverObjectSizeStrategy::from_request(request)?;

    let (bucket, key) = (request.bucket(), request.key());
    let object_meta = retry
        .retry("head object", move || store.head_object(bucket, key))
        .await?;
    let total_size = object_meta.total_size()?;
    tracing::trace!(bucket = request.bucket(), key = request.key(), total_size, "discovered object size");

    let remaining = match strategy {
        DiscoverObjectSizeStrategy::HeadObject => total_size.checked_sub(1).map(|last| 0..=last),
        DiscoverObjectSizeStrategy::HeadObjectInRange(range) => range.resolve(total_size)?,
    };

    Ok(DiscoverResult {
        remaining,
        object_meta,
    })
}
