//! # psi-hashing
//!
//! Builds a disk-resident, multi-hash bucketed table from a flat file of
//! 16-byte elements too large to hold in memory.
//!
//! Every element is hashed with `hash_n` independent seeds. Each digest
//! picks a bucket and, within the final table, a slot chain, so a later
//! matching stage can find any element by probing `hash_n` chains instead
//! of scanning the dataset.
//!
//! ## Passes
//!
//! 1. **Partition** ([`PartitionPipeline`]): stream the source in chunks,
//!    route each `(element, seed)` pair to its bucket through bounded
//!    per-bucket buffers ([`BucketBufferPool`]) that spill to one append-only
//!    file per bucket ([`BucketFileStore`]).
//! 2. **Consolidate** ([`TableBuilder`]): read back each bucket in order,
//!    rehash every record with the seed it was routed by, group records
//!    into slot chains and write them to rotating `result<N>` shards.
//!
//! A manifest ([`TableManifest`]) is written last; [`TableReader`] uses it
//! to walk shards and probe for elements.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use psi_hashing::{build_table, generate_seeds, HashingConfig, TableReader, Xxh3Seeded};
//!
//! let config = HashingConfig::new("/data/source1000000", "/data/buckets", generate_seeds(3, 42))
//!     .with_bucket_count(256)
//!     .with_dataset_size_exponent(6)
//!     .with_table_size_factor(1.2);
//! let report = build_table(&config)?;
//! println!("{} chains in {} shards", report.table.chains_written, report.table.shards.len());
//!
//! let table = TableReader::open(&report.manifest_path)?;
//! let found = table.contains::<Xxh3Seeded>(&[0u8; 16])?;
//! # Ok::<(), psi_hashing::HashingError>(())
//! ```

pub mod bucket_store;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod hasher;
pub mod layout;
pub mod partition;
pub mod persistence;
pub mod table_builder;
pub mod table_reader;
pub mod types;

mod util;

pub use bucket_store::{BucketFileStore, BucketReader};
pub use buffer_pool::{BucketBufferPool, FlushStats};
pub use config::HashingConfig;
pub use error::HashingError;
pub use hasher::{generate_seeds, SeededHasher, Sha3Seeded, Xxh3Seeded};
pub use layout::TableLayout;
pub use partition::{PartitionPipeline, PartitionStats};
pub use persistence::{ShardEntry, TableManifest, MANIFEST_FILE_NAME};
pub use table_builder::{TableBuilder, TableStats};
pub use table_reader::{ProbeHit, ShardReader, TableReader};
pub use types::{ChainRecord, Element, Seed, SlotChain, TaggedElement};

use log::info;
use std::path::PathBuf;

/// Outcome of a complete build.
#[derive(Clone, Debug)]
pub struct BuildReport {
    pub layout: TableLayout,
    pub partition: PartitionStats,
    pub table: TableStats,
    pub manifest_path: PathBuf,
}

/// Run both passes with the default hasher and write the manifest.
pub fn build_table(config: &HashingConfig) -> Result<BuildReport, HashingError> {
    build_table_with_hasher::<Xxh3Seeded>(config)
}

/// Run both passes with hasher `H` and write the manifest.
///
/// Pass 2 starts only after pass 1 has flushed every bucket buffer.
pub fn build_table_with_hasher<H: SeededHasher>(
    config: &HashingConfig,
) -> Result<BuildReport, HashingError> {
    let layout = config.validate()?;
    config.log_settings();

    let store = BucketFileStore::create(&config.bucket_dir, config.bucket_count)?;
    let partition = PartitionPipeline::<H>::new(config, layout, store.clone()).run()?;
    let table = TableBuilder::<H>::new(
        config.seeds.clone(),
        layout,
        store.clone(),
        config.shard_base_index,
        config.read_batch_records,
    )
    .run()?;

    let manifest = TableManifest {
        hasher: H::NAME.to_string(),
        seeds: config.seeds.clone(),
        layout,
        shards: table.shards.clone(),
    };
    let manifest_path = store.root().join(MANIFEST_FILE_NAME);
    persistence::write_manifest(&manifest_path, &manifest)?;

    info!("PSI simple hashing: done");
    Ok(BuildReport {
        layout,
        partition,
        table,
        manifest_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(path: &std::path::Path, n: u32) {
        let mut f = std::fs::File::create(path).unwrap();
        for i in 0..n {
            let mut element = [0xA5u8; 16];
            element[..4].copy_from_slice(&i.to_be_bytes());
            f.write_all(&element).unwrap();
        }
    }

    #[test]
    fn test_build_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        write_source(&source, 300);

        let config = HashingConfig::new(&source, dir.path().join("buckets"), generate_seeds(3, 11))
            .with_bucket_count(8)
            .with_queue_capacity(16)
            .with_read_chunk_size(64)
            .with_worker_count(2)
            .with_dataset_size_exponent(3);
        let report = build_table(&config).unwrap();

        assert_eq!(report.partition.elements_read, 300);
        assert_eq!(report.table.records_read, 900);
        assert_eq!(report.table.placement_mismatches, 0);

        let table = TableReader::open(&report.manifest_path).unwrap();
        let mut element = [0xA5u8; 16];
        element[..4].copy_from_slice(&17u32.to_be_bytes());
        let hits = table.probe::<Xxh3Seeded>(&element).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.found));

        assert!(!table.contains::<Xxh3Seeded>(&[0u8; 16]).unwrap());
    }

    #[test]
    fn test_invalid_config_fails_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let config = HashingConfig::new(dir.path().join("missing"), dir.path().join("b"), vec![])
            .with_bucket_count(4);
        assert!(matches!(
            build_table(&config),
            Err(HashingError::InvalidConfig(_))
        ));
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_probe_requires_same_hasher() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        write_source(&source, 20);
        let config = HashingConfig::new(&source, dir.path().join("buckets"), generate_seeds(2, 1))
            .with_bucket_count(4)
            .with_dataset_size_exponent(2)
            .with_worker_count(1);
        let report = build_table_with_hasher::<Sha3Seeded>(&config).unwrap();
        let table = TableReader::open(&report.manifest_path).unwrap();

        let mut element = [0xA5u8; 16];
        element[..4].copy_from_slice(&3u32.to_be_bytes());
        assert!(table.contains::<Sha3Seeded>(&element).unwrap());
        assert!(matches!(
            table.probe::<Xxh3Seeded>(&element),
            Err(HashingError::HasherMismatch { .. })
        ));
    }
}
