//! Table manifest persistence
//!
//! The manifest makes a finished table self-describing: hasher, seeds,
//! geometry and the bucket range of every output shard.
//!
//! Features:
//! - Format versioning for safe evolution
//! - Checksum validation for data integrity
//! - Atomic writes so a crashed build never leaves a half-written manifest

use crate::error::HashingError;
use crate::layout::TableLayout;
use crate::types::Seed;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Current format version - increment when format changes
const FORMAT_VERSION: u32 = 1;

/// Magic number to identify our file format
const MAGIC: &[u8; 8] = b"PSIHASH1";

/// File name of the manifest inside the bucket directory.
pub const MANIFEST_FILE_NAME: &str = "manifest";

/// File format header
#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    magic: [u8; 8],
    version: u32,
    /// Total file size in bytes (for validation)
    file_size: u64,
    /// CRC32 checksum of data section
    checksum: u32,
    shard_count: u64,
}

impl FileHeader {
    fn new(data_len: usize, checksum: u32, shard_count: usize) -> Result<Self, HashingError> {
        let mut header = Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            file_size: 0,
            checksum,
            shard_count: shard_count as u64,
        };
        header.file_size = bincode::serialized_size(&header)? + data_len as u64;
        Ok(header)
    }

    fn validate(&self, actual_size: u64) -> Result<(), HashingError> {
        if &self.magic != MAGIC {
            return Err(HashingError::Manifest(format!(
                "expected magic {:?}, got {:?}",
                MAGIC, self.magic
            )));
        }

        if self.version != FORMAT_VERSION {
            return Err(HashingError::Manifest(format!(
                "incompatible format version: expected {}, got {}",
                FORMAT_VERSION, self.version
            )));
        }

        if self.file_size != actual_size {
            return Err(HashingError::Manifest(format!(
                "file size mismatch: header says {}, file has {}",
                self.file_size, actual_size
            )));
        }

        Ok(())
    }
}

/// One output shard and the buckets serialized into it, in file order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    /// `N` of the `result<N>` file.
    pub index: u32,
    pub file_name: String,
    pub first_bucket: u32,
    /// Buckets that produced chains; skipped (empty) buckets are absent.
    pub buckets: Vec<u32>,
    /// Physical 17-byte records in the shard, sentinels included.
    pub records: u64,
}

/// Everything needed to locate elements in a finished table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableManifest {
    pub hasher: String,
    pub seeds: Vec<Seed>,
    pub layout: TableLayout,
    pub shards: Vec<ShardEntry>,
}

/// Writer for atomic file operations
pub struct AtomicWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicWriter {
    /// Create a new atomic writer
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, HashingError> {
        let final_path = path.as_ref().to_path_buf();
        let temp_path = final_path.with_extension("tmp");

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path,
            final_path,
            writer: BufWriter::new(file),
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), HashingError> {
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Flush, sync and rename into place.
    pub fn commit(mut self) -> Result<(), HashingError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        // Clean up temp file if commit wasn't called
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

/// Calculate CRC32 checksum
pub fn calculate_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Write the manifest with full integrity protection
pub fn write_manifest<P: AsRef<Path>>(path: P, manifest: &TableManifest) -> Result<(), HashingError> {
    let data_bytes = bincode::serialize(manifest)?;
    let header = FileHeader::new(
        data_bytes.len(),
        calculate_checksum(&data_bytes),
        manifest.shards.len(),
    )?;
    let header_bytes = bincode::serialize(&header)?;

    let mut writer = AtomicWriter::new(path)?;
    writer.write_all(&header_bytes)?;
    writer.write_all(&data_bytes)?;
    writer.commit()
}

/// Read a manifest, validating header, checksum and shard count
pub fn read_manifest<P: AsRef<Path>>(path: P) -> Result<TableManifest, HashingError> {
    let file = File::open(path)?;
    let actual_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let header: FileHeader = bincode::deserialize_from(&mut reader)?;
    header.validate(actual_size)?;

    let mut data_bytes = Vec::new();
    reader.read_to_end(&mut data_bytes)?;

    let actual_checksum = calculate_checksum(&data_bytes);
    if actual_checksum != header.checksum {
        return Err(HashingError::Manifest(format!(
            "checksum mismatch: expected {}, got {}",
            header.checksum, actual_checksum
        )));
    }

    let manifest: TableManifest = bincode::deserialize(&data_bytes)?;
    if manifest.shards.len() as u64 != header.shard_count {
        return Err(HashingError::Manifest(format!(
            "shard count mismatch: header says {}, got {}",
            header.shard_count,
            manifest.shards.len()
        )));
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manifest() -> TableManifest {
        TableManifest {
            hasher: "xxh3-64".to_string(),
            seeds: vec![[1; 16], [2; 16]],
            layout: TableLayout::new(8, 2, 1.0, None).unwrap(),
            shards: vec![
                ShardEntry {
                    index: 0,
                    file_name: "result0".to_string(),
                    first_bucket: 0,
                    buckets: vec![0, 1, 3],
                    records: 120,
                },
                ShardEntry {
                    index: 1,
                    file_name: "result1".to_string(),
                    first_bucket: 4,
                    buckets: vec![4, 5, 6, 7],
                    records: 130,
                },
            ],
        }
    }

    #[test]
    fn test_checksum_calculation() {
        let data1 = b"hello world";
        let data2 = b"hello world";
        let data3 = b"hello world!";

        assert_eq!(calculate_checksum(data1), calculate_checksum(data2));
        assert_ne!(calculate_checksum(data1), calculate_checksum(data3));
    }

    #[test]
    fn test_atomic_write_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit.bin");

        let mut writer = AtomicWriter::new(&path).unwrap();
        writer.write_all(b"test data").unwrap();
        writer.commit().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"test data");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_atomic_write_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollback.bin");

        {
            let mut writer = AtomicWriter::new(&path).unwrap();
            writer.write_all(b"test data").unwrap();
            // Dropped without commit
        }

        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let original = manifest();

        write_manifest(&path, &original).unwrap();
        assert_eq!(read_manifest(&path).unwrap(), original);
    }

    #[test]
    fn test_corruption_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        write_manifest(&path, &manifest()).unwrap();

        let mut content = fs::read(&path).unwrap();
        let last = content.len() - 1;
        content[last] ^= 0xFF;
        fs::write(&path, content).unwrap();

        assert!(matches!(
            read_manifest(&path),
            Err(HashingError::Manifest(_))
        ));
    }

    #[test]
    fn test_truncation_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        write_manifest(&path, &manifest()).unwrap();

        let content = fs::read(&path).unwrap();
        fs::write(&path, &content[..content.len() - 4]).unwrap();
        assert!(read_manifest(&path).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        write_manifest(&path, &manifest()).unwrap();

        let mut content = fs::read(&path).unwrap();
        content[0] = b'X';
        fs::write(&path, content).unwrap();
        assert!(read_manifest(&path).is_err());
    }
}
