//! Run configuration.
//!
//! Paths arrive fully resolved; this module only checks that the numeric
//! parameters describe a buildable table and reports them.

use crate::error::HashingError;
use crate::hasher::seed_to_hex;
use crate::layout::TableLayout;
use crate::types::{Seed, MAX_HASH_FUNCTIONS};
use log::info;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Records per pass-2 read batch.
pub const DEFAULT_READ_BATCH_RECORDS: usize = 1000;
/// How long a producer waits on a flushing bucket before giving up.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct HashingConfig {
    /// Flat file of 16-byte elements.
    pub source_path: PathBuf,
    /// Directory holding bucket spill files, output shards and the manifest.
    pub bucket_dir: PathBuf,
    pub bucket_count: usize,
    /// One seed per hash function; `hash_n == seeds.len()`.
    pub seeds: Vec<Seed>,
    /// Records buffered per bucket before a spill.
    pub queue_capacity: usize,
    /// Elements read from the source per chunk.
    pub read_chunk_size: usize,
    pub worker_count: usize,
    pub table_size_factor: f64,
    /// Expected cardinality is `10^dataset_size_exponent`.
    pub dataset_size_exponent: u32,
    /// Index of the first `result<N>` shard.
    pub shard_base_index: u32,
    pub buckets_per_shard: Option<usize>,
    /// `None` waits forever.
    pub backpressure_timeout: Option<Duration>,
    pub read_batch_records: usize,
}

impl HashingConfig {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        source_path: P,
        bucket_dir: Q,
        seeds: Vec<Seed>,
    ) -> Self {
        Self {
            source_path: source_path.as_ref().to_path_buf(),
            bucket_dir: bucket_dir.as_ref().to_path_buf(),
            bucket_count: 1024,
            seeds,
            queue_capacity: 4096,
            read_chunk_size: 1 << 16,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            table_size_factor: 1.0,
            dataset_size_exponent: 6,
            shard_base_index: 0,
            buckets_per_shard: None,
            backpressure_timeout: Some(DEFAULT_BACKPRESSURE_TIMEOUT),
            read_batch_records: DEFAULT_READ_BATCH_RECORDS,
        }
    }

    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_table_size_factor(mut self, table_size_factor: f64) -> Self {
        self.table_size_factor = table_size_factor;
        self
    }

    pub fn with_dataset_size_exponent(mut self, exponent: u32) -> Self {
        self.dataset_size_exponent = exponent;
        self
    }

    pub fn with_shard_base_index(mut self, index: u32) -> Self {
        self.shard_base_index = index;
        self
    }

    pub fn with_buckets_per_shard(mut self, buckets: Option<usize>) -> Self {
        self.buckets_per_shard = buckets;
        self
    }

    pub fn with_backpressure_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    pub fn with_read_batch_records(mut self, records: usize) -> Self {
        self.read_batch_records = records;
        self
    }

    pub fn hash_n(&self) -> usize {
        self.seeds.len()
    }

    /// Check all parameters and derive the table geometry.
    pub fn validate(&self) -> Result<TableLayout, HashingError> {
        if self.seeds.is_empty() {
            return Err(HashingError::InvalidConfig("at least one seed required".into()));
        }
        if self.seeds.len() > MAX_HASH_FUNCTIONS {
            return Err(HashingError::InvalidConfig(format!(
                "{} seeds given, at most {MAX_HASH_FUNCTIONS} supported",
                self.seeds.len()
            )));
        }
        for (name, value) in [
            ("queue capacity", self.queue_capacity),
            ("read chunk size", self.read_chunk_size),
            ("worker count", self.worker_count),
            ("read batch size", self.read_batch_records),
        ] {
            if value == 0 {
                return Err(HashingError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        TableLayout::new(
            self.bucket_count,
            self.dataset_size_exponent,
            self.table_size_factor,
            self.buckets_per_shard,
        )
    }

    /// Report the effective settings.
    pub fn log_settings(&self) {
        let source_size = std::fs::metadata(&self.source_path)
            .map(|m| m.len())
            .unwrap_or(0);
        info!("Source path        : {}", self.source_path.display());
        info!("Buckets path       : {}", self.bucket_dir.display());
        info!("Bucket count       : {}", self.bucket_count);
        info!("Queue buffer size  : {}", self.queue_capacity);
        info!("Read chunk size    : {}", self.read_chunk_size);
        info!("Workers            : {}", self.worker_count);
        info!("Source size        : {source_size}");
        info!("Table size         : {}", self.table_size_factor);
        info!("Expected elements  : 10^{}", self.dataset_size_exponent);
        info!("Seeds :");
        for seed in &self.seeds {
            info!("  {}", seed_to_hex(seed));
        }
    }
}
