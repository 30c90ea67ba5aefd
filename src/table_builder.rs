//! Pass 2: rehash each bucket file into slot chains and serialize them.
//!
//! Buckets are consumed strictly in index order on the calling thread. For
//! a non-empty bucket, every record is rehashed with the seed named by its
//! tag, mapped to its table position and appended to the chain of
//! `position mod local_partition_count`. Once the file is exhausted, all
//! chains of the bucket are written in index order to the current shard,
//! the bucket file is deleted and the chain arena is cleared for reuse.
//! A new shard opens at every multiple of the layout's shard span.

use crate::bucket_store::BucketFileStore;
use crate::error::HashingError;
use crate::hasher::{SeededHasher, Xxh3Seeded};
use crate::layout::TableLayout;
use crate::persistence::ShardEntry;
use crate::types::{Seed, SlotChain, TaggedElement, RECORD_SIZE};
use crate::util::log_duration;
use log::{info, trace, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::time::Instant;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub buckets_processed: u64,
    pub buckets_skipped: u64,
    pub records_read: u64,
    pub chains_written: u64,
    pub sentinels_written: u64,
    pub placement_mismatches: u64,
    /// Records whose tag names no configured seed; dropped.
    pub invalid_tags: u64,
    pub write_failures: u64,
    pub shards: Vec<ShardEntry>,
}

pub struct TableBuilder<H: SeededHasher = Xxh3Seeded> {
    seeds: Vec<Seed>,
    layout: TableLayout,
    store: BucketFileStore,
    shard_base_index: u32,
    read_batch_records: usize,
    _hasher: PhantomData<H>,
}

impl<H: SeededHasher> TableBuilder<H> {
    pub fn new(
        seeds: Vec<Seed>,
        layout: TableLayout,
        store: BucketFileStore,
        shard_base_index: u32,
        read_batch_records: usize,
    ) -> Self {
        Self {
            seeds,
            layout,
            store,
            shard_base_index,
            read_batch_records: read_batch_records.max(1),
            _hasher: PhantomData,
        }
    }

    /// Consume every bucket file and write the output shards.
    pub fn run(&self) -> Result<TableStats, HashingError> {
        let local_count = self.layout.local_partition_count();
        info!(
            "Building table: {} buckets, {} chains per bucket, {} positions, {} shards",
            self.layout.bucket_count(),
            local_count,
            self.layout.table_positions(),
            self.layout.shard_count()
        );

        let start = Instant::now();
        let mut stats = TableStats::default();
        let mut chains: Vec<Vec<TaggedElement>> = Vec::new();
        chains.try_reserve_exact(local_count).map_err(|e| {
            HashingError::InvalidConfig(format!("cannot allocate {local_count} slot chains: {e}"))
        })?;
        chains.resize_with(local_count, Vec::new);
        let mut batch = Vec::with_capacity(self.read_batch_records);
        let mut shard: Option<ShardWriter> = None;
        let mut next_shard_index = self.shard_base_index;

        for bucket in 0..self.layout.bucket_count() {
            let writer = match shard {
                Some(ref mut writer) if !self.layout.opens_shard(bucket) => writer,
                _ => {
                    if let Some(done) = shard.take() {
                        let entry = done.finish(&mut stats);
                        stats.shards.push(entry);
                    }
                    let writer = ShardWriter::create(&self.store, next_shard_index, bucket)?;
                    next_shard_index += 1;
                    shard.insert(writer)
                }
            };

            if self.store.file_len(bucket)? == 0 {
                trace!("Bucket {bucket}: empty, skipped");
                stats.buckets_skipped += 1;
                self.remove_bucket(bucket);
                continue;
            }

            self.fill_chains(bucket, &mut batch, &mut chains, &mut stats)?;
            writer.write_bucket(bucket, &chains, &mut stats);
            self.remove_bucket(bucket);
            chains.iter_mut().for_each(Vec::clear);
            stats.buckets_processed += 1;
        }

        if let Some(done) = shard.take() {
            let entry = done.finish(&mut stats);
            stats.shards.push(entry);
        }
        log_duration("build table", start);

        if stats.placement_mismatches > 0 {
            warn!(
                "{} records rehashed outside their bucket",
                stats.placement_mismatches
            );
        }
        info!(
            "Table done: {} records in {} chains over {} shards",
            stats.records_read,
            stats.chains_written,
            stats.shards.len()
        );
        Ok(stats)
    }

    fn fill_chains(
        &self,
        bucket: usize,
        batch: &mut Vec<TaggedElement>,
        chains: &mut [Vec<TaggedElement>],
        stats: &mut TableStats,
    ) -> Result<(), HashingError> {
        let owned = self.layout.owned_positions(bucket);
        let mut reader = self.store.reader(bucket, self.read_batch_records)?;
        loop {
            let n = reader.next_batch(batch)?;
            for tagged in batch.iter() {
                let Some(seed) = self.seeds.get(tagged.seed_index as usize) else {
                    warn!(
                        "Bucket {bucket}: record tagged with unknown seed {}, dropped",
                        tagged.seed_index
                    );
                    stats.invalid_tags += 1;
                    continue;
                };
                let position = self.layout.position(H::digest(seed, &tagged.element));
                if !owned.contains(&position) {
                    warn!(
                        "Bucket {bucket}: element with seed {} maps to position {position}, outside {:?}",
                        tagged.seed_index, owned
                    );
                    stats.placement_mismatches += 1;
                }
                chains[self.layout.local_index(position)].push(*tagged);
                stats.records_read += 1;
            }
            if n < self.read_batch_records {
                break;
            }
        }
        Ok(())
    }

    fn remove_bucket(&self, bucket: usize) {
        if let Err(e) = self.store.remove(bucket) {
            log::error!("Error deleting bucket file {bucket}: {e}");
        }
    }
}

struct ShardWriter {
    writer: BufWriter<File>,
    entry: ShardEntry,
}

impl ShardWriter {
    fn create(
        store: &BucketFileStore,
        index: u32,
        first_bucket: usize,
    ) -> Result<Self, HashingError> {
        let path = store.shard_path(index);
        trace!("Opening shard {} at bucket {first_bucket}", path.display());
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(1 << 20, file),
            entry: ShardEntry {
                index,
                file_name: BucketFileStore::shard_file_name(index),
                first_bucket: first_bucket as u32,
                buckets: Vec::new(),
                records: 0,
            },
        })
    }

    fn write_bucket(&mut self, bucket: usize, chains: &[Vec<TaggedElement>], stats: &mut TableStats) {
        let mut failures = 0u64;
        for chain in chains {
            if chain.is_empty() {
                stats.sentinels_written += 1;
            }
            for record in SlotChain::records(chain) {
                if self.writer.write_all(&record.to_bytes()).is_err() {
                    failures += 1;
                } else {
                    self.entry.records += 1;
                }
            }
        }
        stats.chains_written += chains.len() as u64;
        self.entry.buckets.push(bucket as u32);
        if failures > 0 {
            log::error!(
                "Error writing {failures} records of bucket {bucket} to {}",
                self.entry.file_name
            );
            stats.write_failures += failures;
        }
    }

    fn finish(mut self, stats: &mut TableStats) -> ShardEntry {
        if let Err(e) = self.writer.flush() {
            log::error!("Error flushing {}: {e}", self.entry.file_name);
            stats.write_failures += 1;
        }
        trace!(
            "Closed {}: {} buckets, {} bytes",
            self.entry.file_name,
            self.entry.buckets.len(),
            self.entry.records * RECORD_SIZE as u64
        );
        self.entry
    }
}
