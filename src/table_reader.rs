//! Reading a finished table back.
//!
//! Chain boundaries are recovered from the terminator flag alone, so a
//! shard can be walked without any side index. The manifest tells which
//! buckets each shard holds, in order, and every written bucket holds
//! exactly `local_partition_count` chains.

use crate::error::HashingError;
use crate::hasher::SeededHasher;
use crate::persistence::{read_manifest, ShardEntry, TableManifest, MANIFEST_FILE_NAME};
use crate::types::{ChainRecord, Element, SlotChain, RECORD_SIZE};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

/// Iterator over the slot chains of one shard file, in file order.
pub struct ShardReader {
    reader: BufReader<File>,
}

impl ShardReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HashingError> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    fn next_record(&mut self) -> Result<Option<ChainRecord>, HashingError> {
        let mut buf = [0u8; RECORD_SIZE];
        let filled = crate::bucket_store::read_full(&mut self.reader, &mut buf)?;
        match filled {
            0 => Ok(None),
            RECORD_SIZE => Ok(Some(ChainRecord::from_bytes(&buf))),
            n => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("shard ends with a {n}-byte partial record"),
            )
            .into()),
        }
    }

    /// Read the next chain, or `None` at a clean end of file.
    pub fn next_chain(&mut self) -> Result<Option<SlotChain>, HashingError> {
        let mut chain = SlotChain::default();
        loop {
            match self.next_record()? {
                None if chain.is_empty() => return Ok(None),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "shard ends inside an unterminated chain",
                    )
                    .into())
                }
                Some(ChainRecord::Sentinel) => return Ok(Some(chain)),
                Some(ChainRecord::Element { tagged, terminator }) => {
                    chain.entries.push(tagged);
                    if terminator {
                        return Ok(Some(chain));
                    }
                }
            }
        }
    }
}

impl Iterator for ShardReader {
    type Item = Result<SlotChain, HashingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chain().transpose()
    }
}

/// One candidate position of an element, for one seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeHit {
    pub seed_index: u8,
    pub bucket: usize,
    pub position: u64,
    pub local_index: usize,
    pub chain: SlotChain,
    /// The chain holds this element tagged with this seed.
    pub found: bool,
}

pub struct TableReader {
    dir: PathBuf,
    manifest: TableManifest,
}

impl TableReader {
    /// Open the table whose manifest lives at `manifest_path`. Shards are
    /// looked up next to it.
    pub fn open<P: AsRef<Path>>(manifest_path: P) -> Result<Self, HashingError> {
        let manifest_path = manifest_path.as_ref();
        let manifest = read_manifest(manifest_path)?;
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self { dir, manifest })
    }

    /// Open the table built in `dir`.
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> Result<Self, HashingError> {
        Self::open(dir.as_ref().join(MANIFEST_FILE_NAME))
    }

    pub fn manifest(&self) -> &TableManifest {
        &self.manifest
    }

    pub fn shard_path(&self, shard: &ShardEntry) -> PathBuf {
        self.dir.join(&shard.file_name)
    }

    /// The chains of `bucket` in local index order, or `None` if the bucket
    /// was empty and skipped.
    pub fn chains(&self, bucket: usize) -> Result<Option<Vec<SlotChain>>, HashingError> {
        let layout = &self.manifest.layout;
        if bucket >= layout.bucket_count() {
            return Err(HashingError::BucketOutOfRange {
                bucket,
                bucket_count: layout.bucket_count(),
            });
        }
        let shard = self
            .manifest
            .shards
            .get(layout.shard_ordinal(bucket))
            .ok_or_else(|| HashingError::Manifest(format!("no shard holds bucket {bucket}")))?;
        let Some(rank) = shard.buckets.iter().position(|&b| b as usize == bucket) else {
            return Ok(None);
        };

        let per_bucket = layout.local_partition_count();
        let mut reader = ShardReader::open(self.shard_path(shard))?;
        for _ in 0..rank * per_bucket {
            if reader.next_chain()?.is_none() {
                return Err(HashingError::Manifest(format!(
                    "{} ends before bucket {bucket}",
                    shard.file_name
                )));
            }
        }
        let mut chains = Vec::with_capacity(per_bucket);
        for _ in 0..per_bucket {
            match reader.next_chain()? {
                Some(chain) => chains.push(chain),
                None => {
                    return Err(HashingError::Manifest(format!(
                        "{} ends inside bucket {bucket}",
                        shard.file_name
                    )))
                }
            }
        }
        Ok(Some(chains))
    }

    /// Every candidate position of `element`, one per seed.
    pub fn probe<H: SeededHasher>(&self, element: &Element) -> Result<Vec<ProbeHit>, HashingError> {
        if self.manifest.hasher != H::NAME {
            return Err(HashingError::HasherMismatch {
                expected: self.manifest.hasher.clone(),
                found: H::NAME,
            });
        }
        let layout = &self.manifest.layout;
        self.manifest
            .seeds
            .iter()
            .enumerate()
            .map(|(seed_index, seed)| -> Result<ProbeHit, HashingError> {
                let digest = H::digest(seed, element);
                let bucket = layout.assign_bucket(digest);
                let position = layout.position(digest);
                let local_index = layout.local_index(position);
                let chain = self
                    .chains(bucket)?
                    .and_then(|mut chains| chains.get_mut(local_index).map(std::mem::take))
                    .unwrap_or_default();
                let found = chain
                    .entries
                    .iter()
                    .any(|t| &t.element == element && t.seed_index as usize == seed_index);
                Ok(ProbeHit {
                    seed_index: seed_index as u8,
                    bucket,
                    position,
                    local_index,
                    chain,
                    found,
                })
            })
            .collect()
    }

    /// Whether any candidate position holds `element`.
    pub fn contains<H: SeededHasher>(&self, element: &Element) -> Result<bool, HashingError> {
        Ok(self.probe::<H>(element)?.iter().any(|hit| hit.found))
    }
}
