//! Arithmetic shared by both passes: digest → bucket, digest → table
//! position, position → local partition, bucket → output shard.

use crate::error::HashingError;
use crate::hasher::SeededHasher;
use crate::types::{Element, Seed};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Largest supported dataset-size exponent (`10^18` still fits a `u64`).
pub const MAX_DATASET_EXPONENT: u32 = 18;

/// Upper bound on slot chains per bucket; pass 2 keeps one chain head per
/// local partition in memory.
pub const MAX_LOCAL_PARTITIONS: usize = 1 << 28;

/// Derived, immutable geometry of one table build.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    bucket_count: usize,
    expected_cardinality: u64,
    table_positions: u64,
    bucket_divisor: u64,
    table_divisor: u64,
    local_partition_count: usize,
    shard_span: usize,
}

impl TableLayout {
    pub fn new(
        bucket_count: usize,
        dataset_size_exponent: u32,
        table_size_factor: f64,
        buckets_per_shard: Option<usize>,
    ) -> Result<Self, HashingError> {
        if bucket_count == 0 {
            return Err(HashingError::InvalidConfig("bucket count must be > 0".into()));
        }
        if dataset_size_exponent > MAX_DATASET_EXPONENT {
            return Err(HashingError::InvalidConfig(format!(
                "dataset size exponent {dataset_size_exponent} exceeds {MAX_DATASET_EXPONENT}"
            )));
        }
        if !table_size_factor.is_finite() || table_size_factor <= 0.0 {
            return Err(HashingError::InvalidConfig(format!(
                "table size factor must be positive, got {table_size_factor}"
            )));
        }
        if buckets_per_shard == Some(0) {
            return Err(HashingError::InvalidConfig(
                "buckets per shard must be > 0".into(),
            ));
        }

        let expected_cardinality = 10u64.pow(dataset_size_exponent);
        let table_positions = ((expected_cardinality as f64 * table_size_factor).round() as u64).max(1);
        if (bucket_count as u64) > table_positions {
            return Err(HashingError::InvalidConfig(format!(
                "{bucket_count} buckets for only {table_positions} table positions"
            )));
        }

        let n = bucket_count as u64;
        let local_partition_count = usize::try_from((expected_cardinality + n) / n)
            .ok()
            .filter(|&l| l <= MAX_LOCAL_PARTITIONS)
            .ok_or_else(|| {
                HashingError::InvalidConfig(format!(
                    "10^{dataset_size_exponent} elements over {bucket_count} buckets needs more than \
                     {MAX_LOCAL_PARTITIONS} slot chains per bucket"
                ))
            })?;
        // With a quarter of one bucket or less, every bucket would open a shard.
        let shard_span = buckets_per_shard.unwrap_or(match bucket_count / 4 {
            q if q <= 1 => bucket_count,
            q => q,
        });

        Ok(Self {
            bucket_count,
            expected_cardinality,
            table_positions,
            bucket_divisor: u64::MAX / n,
            table_divisor: u64::MAX / table_positions,
            local_partition_count,
            shard_span,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn expected_cardinality(&self) -> u64 {
        self.expected_cardinality
    }

    pub fn table_positions(&self) -> u64 {
        self.table_positions
    }

    pub fn local_partition_count(&self) -> usize {
        self.local_partition_count
    }

    pub fn shard_span(&self) -> usize {
        self.shard_span
    }

    /// Pass-1 bucket of a digest.
    ///
    /// When `bucket_count` does not divide `u64::MAX`, the top digests would
    /// land on index `bucket_count`; they are folded into the last bucket,
    /// which therefore owns a slightly larger share of the digest space.
    #[inline(always)]
    pub fn assign_bucket(&self, digest: u64) -> usize {
        ((digest / self.bucket_divisor) as usize).min(self.bucket_count - 1)
    }

    /// Pass-1 bucket of `element` under `seed`.
    #[inline]
    pub fn bucket_of<H: SeededHasher>(&self, seed: &Seed, element: &Element) -> usize {
        self.assign_bucket(H::digest(seed, element))
    }

    /// Table-wide position of a digest.
    #[inline(always)]
    pub fn position(&self, digest: u64) -> u64 {
        digest / self.table_divisor
    }

    /// Positions reachable from digests assigned to `bucket`.
    pub fn owned_positions(&self, bucket: usize) -> RangeInclusive<u64> {
        let b = bucket as u64;
        let lo = b * self.bucket_divisor / self.table_divisor;
        let hi = if bucket + 1 >= self.bucket_count {
            u64::MAX / self.table_divisor
        } else {
            ((b + 1) * self.bucket_divisor - 1) / self.table_divisor
        };
        lo..=hi
    }

    /// Slot chain index of a position within its bucket.
    #[inline(always)]
    pub fn local_index(&self, position: u64) -> usize {
        (position % self.local_partition_count as u64) as usize
    }

    /// Whether processing `bucket` starts a new output shard.
    pub fn opens_shard(&self, bucket: usize) -> bool {
        bucket % self.shard_span == 0
    }

    /// Zero-based ordinal of the shard holding `bucket`.
    pub fn shard_ordinal(&self, bucket: usize) -> usize {
        bucket / self.shard_span
    }

    pub fn shard_count(&self) -> usize {
        self.bucket_count.div_ceil(self.shard_span)
    }
}
