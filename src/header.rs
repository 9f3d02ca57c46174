use core::fmt;
use std::{ops::RangeInclusive, str::FromStr};

use crate::error::{self, TransferError};

/// Representation of `Range` header.
/// NOTE: S3 only supports a single bytes range this is a simplified representation
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Range(pub(crate) ByteRange);

impl Range {
    pub(crate) fn bytes_inclusive(start: u64, end: u64) -> Self {
        Range(ByteRange::Inclusive(start, end))
    }
}

impl From<RangeInclusive<u64>> for Range {
    fn from(value: RangeInclusive<u64>) -> Self {
        Range::bytes_inclusive(*value.start(), *value.end())
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}", self.0)
    }
}

impl From<Range> for String {
    fn from(value: Range) -> Self {
        value.to_string()
    }
}

impl FromStr for Range {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some(("bytes", spec)) if spec.contains(',') => Err(error::invalid_meta_request(
                format!("multiple byte ranges not supported for range header {}", s),
            )),
            Some(("bytes", spec)) => ByteRange::from_str(spec)
                .map(Range)
                .map_err(|_| error::invalid_meta_request(format!("invalid range header {}", s))),
            _ => Err(error::invalid_meta_request(format!(
                "unsupported byte range header format {}",
                s
            ))),
        }
    }
}

/// Representation of a single [RFC-9110 byte range](https://www.rfc-editor.org/rfc/rfc9110.html#name-byte-ranges)
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ByteRange {
    /// Get all bytes between x and y inclusive ("bytes=x-y")
    Inclusive(u64, u64),

    /// Get all bytes starting from x ("bytes=x-")
    AllFrom(u64),

    /// Get the last n bytes ("bytes=-n")
    Last(u64),
}

impl ByteRange {
    /// Resolve against an object of `total_size` bytes.
    ///
    /// Returns `None` when the range selects no bytes (empty object or `bytes=-0`) and an
    /// error when it starts past the end of the object. An end past the object is clamped.
    pub(crate) fn resolve(&self, total_size: u64) -> Result<Option<RangeInclusive<u64>>, TransferError> {
        let last = match total_size.checked_sub(1) {
            Some(last) => last,
            None => return Ok(None),
        };
        let range = match *self {
            ByteRange::Inclusive(start, end) => start..=end.min(last),
            ByteRange::AllFrom(start) => start..=last,
            ByteRange::Last(0) => return Ok(None),
            ByteRange::Last(n) => total_size.saturating_sub(n)..=last,
        };
        if *range.start() > last {
            return Err(error::invalid_meta_request(format!(
                "range {} not satisfiable for object of {} bytes",
                self, total_size
            )));
        }
        Ok(Some(range))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ByteRange::Inclusive(start, end) => write!(f, "{}-{}", start, end),
            ByteRange::AllFrom(from) => write!(f, "{}-", from),
            ByteRange::Last(n) => write!(f, "-{}", n),
        }
    }
}

impl FromStr for ByteRange {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some(("", end)) => end.parse().map(ByteRange::Last).map_err(|_| ()),
            Some((start, "")) => start.parse().map(ByteRange::AllFrom).map_err(|_| ()),
            Some((start, end)) => match (start.parse(), end.parse()) {
                (Ok(start), Ok(end)) if start <= end => Ok(ByteRange::Inclusive(start, end)),
                _ => Err(()),
            },
            None => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteRange, Range};
    use crate::error::TransferError;

    #[test]
    fn test_parse_range_header() {
        let cases = [
            ("bytes=-500", ByteRange::Last(500)),
            ("bytes=200-", ByteRange::AllFrom(200)),
            ("bytes=200-500", ByteRange::Inclusive(200, 500)),
            ("bytes=7-7", ByteRange::Inclusive(7, 7)),
        ];
        for (header, expected) in cases {
            assert_eq!(expected, header.parse::<Range>().unwrap().0, "{header}");
        }
        assert_eq!("bytes=200-500", String::from(Range::from(200..=500)));
    }

    #[test]
    fn test_reject_unsupported_range_header() {
        let cases = [
            ("bytes=-", "invalid range header"),
            ("bytes=500-200", "invalid range header"),
            ("bytes=abc-def", "invalid range header"),
            ("bytes=0-200,400-500", "multiple byte ranges not supported"),
            ("items=0-5", "unsupported byte range header"),
            ("0-5", "unsupported byte range header"),
        ];
        for (header, msg) in cases {
            match header.parse::<Range>().unwrap_err() {
                TransferError::InvalidMetaRequest(m) => {
                    assert!(m.contains(msg), "'{m}' does not contain '{msg}'")
                }
                other => panic!("unexpected error for {header}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_resolve_against_object_size() {
        assert_eq!(Some(10..=99), ByteRange::AllFrom(10).resolve(100).unwrap());
        assert_eq!(Some(90..=99), ByteRange::Last(10).resolve(100).unwrap());
        assert_eq!(Some(0..=99), ByteRange::Last(500).resolve(100).unwrap());
        assert_eq!(Some(5..=99), ByteRange::Inclusive(5, 1000).resolve(100).unwrap());
        assert_eq!(None, ByteRange::Last(0).resolve(100).unwrap());
        assert_eq!(None, ByteRange::AllFrom(0).resolve(0).unwrap());
        assert!(ByteRange::AllFrom(100).resolve(100).is_err());
    }
}
