//! Pass 1: fan every element out to one bucket per hash function.
//!
//! The source is read sequentially in chunks of `read_chunk_size` elements
//! by the calling thread. Each chunk is hashed and routed on a rayon pool
//! of `worker_count` threads, and the next chunk is only read once the
//! current one is fully routed, so at most one chunk is in memory.

use crate::bucket_store::{read_full, BucketFileStore};
use crate::buffer_pool::{BucketBufferPool, FlushStats};
use crate::config::HashingConfig;
use crate::error::HashingError;
use crate::hasher::{SeededHasher, Xxh3Seeded};
use crate::layout::TableLayout;
use crate::types::{Element, Seed, TaggedElement, ELEMENT_SIZE};
use crate::util::log_duration;
use log::{info, trace, warn};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub elements_read: u64,
    pub chunks: u64,
    /// Bytes after the last whole element of the source.
    pub trailing_bytes: usize,
    pub buffers: FlushStats,
}

pub struct PartitionPipeline<H: SeededHasher = Xxh3Seeded> {
    source_path: PathBuf,
    seeds: Vec<Seed>,
    layout: TableLayout,
    store: BucketFileStore,
    queue_capacity: usize,
    read_chunk_size: usize,
    worker_count: usize,
    backpressure_timeout: Option<Duration>,
    _hasher: PhantomData<H>,
}

impl<H: SeededHasher> PartitionPipeline<H> {
    pub fn new(config: &HashingConfig, layout: TableLayout, store: BucketFileStore) -> Self {
        Self {
            source_path: config.source_path.clone(),
            seeds: config.seeds.clone(),
            layout,
            store,
            queue_capacity: config.queue_capacity,
            read_chunk_size: config.read_chunk_size,
            worker_count: config.worker_count,
            backpressure_timeout: config.backpressure_timeout,
            _hasher: PhantomData,
        }
    }

    /// Partition the whole source into bucket files. Every buffer is
    /// flushed before this returns successfully.
    pub fn run(&self) -> Result<PartitionStats, HashingError> {
        let file = File::open(&self.source_path).map_err(|source| HashingError::SourceOpen {
            path: self.source_path.clone(),
            source,
        })?;
        let mut reader = BufReader::new(file);

        info!(
            "Partitioning {} into {} buckets with {} hash functions on {} workers",
            self.source_path.display(),
            self.layout.bucket_count(),
            self.seeds.len(),
            self.worker_count
        );

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_count)
            .thread_name(|i| format!("psi-partition-{i}"))
            .build()
            .map_err(|e| HashingError::ThreadPool(e.to_string()))?;
        let pool = BucketBufferPool::new(
            self.store.clone(),
            self.queue_capacity,
            self.backpressure_timeout,
        );

        let start = Instant::now();
        let mut stats = PartitionStats::default();
        let mut bytes = vec![0u8; self.read_chunk_size * ELEMENT_SIZE];
        let mut chunk: Vec<Element> = Vec::with_capacity(self.read_chunk_size);

        loop {
            let filled = read_full(&mut reader, &mut bytes)?;
            chunk.clear();
            chunk.extend(bytes[..filled - filled % ELEMENT_SIZE].chunks_exact(ELEMENT_SIZE).map(
                |b| {
                    let mut element = [0u8; ELEMENT_SIZE];
                    element.copy_from_slice(b);
                    element
                },
            ));

            if !chunk.is_empty() {
                workers.install(|| {
                    chunk
                        .par_iter()
                        .try_for_each(|element| self.route(&pool, element))
                })?;
                stats.elements_read += chunk.len() as u64;
                stats.chunks += 1;
                trace!("Chunk {}: {} elements", stats.chunks, chunk.len());
            }

            if chunk.len() < self.read_chunk_size {
                stats.trailing_bytes = filled % ELEMENT_SIZE;
                if stats.trailing_bytes > 0 {
                    warn!(
                        "Source ends with {} bytes of a partial element, ignored",
                        stats.trailing_bytes
                    );
                }
                break;
            }
        }
        let start = log_duration("route chunks", start);

        pool.flush_all()?;
        log_duration("flush buckets", start);

        stats.buffers = pool.stats();
        if stats.buffers.write_failures > 0 {
            warn!(
                "{} bucket writes failed, {} records lost",
                stats.buffers.write_failures, stats.buffers.records_lost
            );
        }
        info!(
            "Partitioned {} elements into {} records",
            stats.elements_read, stats.buffers.records_enqueued
        );
        Ok(stats)
    }

    fn route(&self, pool: &BucketBufferPool, element: &Element) -> Result<(), HashingError> {
        for (seed_index, seed) in self.seeds.iter().enumerate() {
            let bucket = self.layout.bucket_of::<H>(seed, element);
            pool.enqueue(bucket, TaggedElement::new(*element, seed_index as u8))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::generate_seeds;
    use std::io::Write;

    fn write_source(path: &std::path::Path, n: u64, extra: &[u8]) {
        let mut f = File::create(path).unwrap();
        for i in 0..n {
            let mut element = [0u8; 16];
            element[..8].copy_from_slice(&i.to_le_bytes());
            element[8..].copy_from_slice(&(!i).to_le_bytes());
            f.write_all(&element).unwrap();
        }
        f.write_all(extra).unwrap();
    }

    fn setup(
        n: u64,
        extra: &[u8],
        chunk: usize,
    ) -> (tempfile::TempDir, HashingConfig, TableLayout, BucketFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        write_source(&source, n, extra);
        let config = HashingConfig::new(&source, dir.path().join("buckets"), generate_seeds(3, 9))
            .with_bucket_count(5)
            .with_queue_capacity(4)
            .with_read_chunk_size(chunk)
            .with_worker_count(3)
            .with_dataset_size_exponent(2);
        let layout = config.validate().unwrap();
        let store = BucketFileStore::create(&config.bucket_dir, 5).unwrap();
        (dir, config, layout, store)
    }

    #[test]
    fn test_every_element_routed_once_per_seed() {
        let (_dir, config, layout, store) = setup(57, &[], 10);
        let stats = PartitionPipeline::<Xxh3Seeded>::new(&config, layout, store.clone())
            .run()
            .unwrap();
        assert_eq!(stats.elements_read, 57);
        assert_eq!(stats.chunks, 6);
        assert_eq!(stats.buffers.records_enqueued, 57 * 3);

        let total: u64 = (0..5).map(|b| store.record_count(b).unwrap()).sum();
        assert_eq!(total, 57 * 3);

        for bucket in 0..5 {
            for batch in store.reader(bucket, 16).unwrap() {
                for t in batch.unwrap() {
                    let seed = &config.seeds[t.seed_index as usize];
                    assert_eq!(layout.bucket_of::<Xxh3Seeded>(seed, &t.element), bucket);
                }
            }
        }
    }

    #[test]
    fn test_chunk_size_multiple_of_input() {
        let (_dir, config, layout, store) = setup(40, &[], 10);
        let stats = PartitionPipeline::<Xxh3Seeded>::new(&config, layout, store.clone())
            .run()
            .unwrap();
        assert_eq!(stats.elements_read, 40);
        assert_eq!(stats.chunks, 4);
    }

    #[test]
    fn test_trailing_partial_element_ignored() {
        let (_dir, config, layout, store) = setup(9, &[1, 2, 3], 4);
        let stats = PartitionPipeline::<Xxh3Seeded>::new(&config, layout, store.clone())
            .run()
            .unwrap();
        assert_eq!(stats.elements_read, 9);
        assert_eq!(stats.trailing_bytes, 3);
        let total: u64 = (0..5).map(|b| store.record_count(b).unwrap()).sum();
        assert_eq!(total, 27);
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let (dir, mut config, layout, store) = setup(1, &[], 4);
        config.source_path = dir.path().join("nope");
        let err = PartitionPipeline::<Xxh3Seeded>::new(&config, layout, store)
            .run()
            .unwrap_err();
        assert!(matches!(err, HashingError::SourceOpen { .. }));
    }
}
