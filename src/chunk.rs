/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::cmp;

use crate::{
    error::{self, TransferError},
    types::{Part, TransferId},
    GIBI_BYTE, MIN_PART_SIZE,
};

/// Maximum number of parts of a single multipart object
pub const MAX_PARTS: u64 = 10_000;

/// Maximum size of a single part
pub const MAX_PART_SIZE: u64 = 5 * GIBI_BYTE;

/// Part size and count for a multipart transfer.
///
/// Every part is `part_size` bytes except the last, which holds the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    total_size: u64,
    part_size: u64,
    part_count: u64,
}

impl PartPlan {
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn part_count(&self) -> u64 {
        self.part_count
    }

    /// Size of the final part, `1 <= last_part_size <= part_size`
    pub fn last_part_size(&self) -> u64 {
        self.total_size - self.part_size * (self.part_count - 1)
    }

    /// Parts covering `offset..offset + total_size`, numbered from 1
    pub(crate) fn parts(&self, transfer: TransferId, offset: u64) -> Vec<Part> {
        (0..self.part_count)
            .map(|idx| {
                let start = offset + idx * self.part_size;
                let end = cmp::min(start + self.part_size, offset + self.total_size);
                Part {
                    transfer,
                    part_number: idx + 1,
                    range: start..end,
                }
            })
            .collect()
    }
}

/// Compute the part size and count for a multipart transfer of `total_size` bytes.
///
/// The part size starts at the larger of `min_part_size` and the size needed to fit in
/// `max_parts` parts and is never decreased. A plan that needs parts larger than
/// `max_part_size` is a configuration error.
pub fn plan(
    total_size: u64,
    min_part_size: u64,
    max_parts: u64,
    max_part_size: u64,
) -> Result<PartPlan, TransferError> {
    if total_size == 0 {
        return Err(error::invalid_meta_request(
            "multipart transfers require a non-empty object",
        ));
    }
    if min_part_size == 0 || max_parts == 0 {
        return Err(error::invalid_config(
            "minimum part size and maximum part count must be positive",
        ));
    }
    if min_part_size > max_part_size {
        return Err(error::invalid_config(format!(
            "minimum part size {} exceeds maximum part size {}",
            min_part_size, max_part_size
        )));
    }

    // part_size * max_parts >= total_size, so the count always fits
    let part_size = cmp::max(min_part_size, total_size.div_ceil(max_parts));
    if part_size > max_part_size {
        return Err(error::invalid_config(format!(
            "object of {} bytes needs parts of {} bytes which exceeds the maximum part size {}",
            total_size, part_size, max_part_size
        )));
    }

    Ok(PartPlan {
        total_size,
        part_size,
        part_count: total_size.div_ceil(part_size),
    })
}

/// Provider limits for multipart transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    min_part_size: u64,
    max_parts: u64,
    max_part_size: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_parts: MAX_PARTS,
            max_part_size: MAX_PART_SIZE,
        }
    }
}

impl ChunkPolicy {
    pub fn new(min_part_size: u64, max_parts: u64, max_part_size: u64) -> Result<Self, TransferError> {
        if min_part_size == 0 || max_parts == 0 || min_part_size > max_part_size {
            return Err(error::invalid_config(format!(
                "invalid part limits: min part size {}, max parts {}, max part size {}",
                min_part_size, max_parts, max_part_size
            )));
        }
        Ok(Self {
            min_part_size,
            max_parts,
            max_part_size,
        })
    }

    pub fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    pub fn max_parts(&self) -> u64 {
        self.max_parts
    }

    pub fn max_part_size(&self) -> u64 {
        self.max_part_size
    }

    /// Plan a transfer of `total_size` bytes using parts of at least `part_size_hint` bytes
    pub fn plan(&self, total_size: u64, part_size_hint: u64) -> Result<PartPlan, TransferError> {
        plan(
            total_size,
            cmp::max(part_size_hint, self.min_part_size),
            self.max_parts,
            self.max_part_size,
        )
    }
}
