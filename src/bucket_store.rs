//! Per-bucket spill files.
//!
//! Bucket `b` lives at `<root>/<b>` as a flat run of 17-byte
//! [`TaggedElement`] records, appended during pass 1 and read back in fixed
//! size batches during pass 2. Output shards share the same directory as
//! `<root>/result<N>`.

use crate::error::HashingError;
use crate::types::{TaggedElement, RECORD_SIZE};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct BucketFileStore {
    root: PathBuf,
    bucket_count: usize,
}

impl BucketFileStore {
    /// Use `root` as the bucket directory, creating it if needed.
    pub fn create<P: AsRef<Path>>(root: P, bucket_count: usize) -> Result<Self, HashingError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, bucket_count })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn bucket_path(&self, bucket: usize) -> PathBuf {
        self.root.join(bucket.to_string())
    }

    pub fn shard_file_name(index: u32) -> String {
        format!("result{index}")
    }

    pub fn shard_path(&self, index: u32) -> PathBuf {
        self.root.join(Self::shard_file_name(index))
    }

    fn check(&self, bucket: usize) -> Result<(), HashingError> {
        if bucket >= self.bucket_count {
            return Err(HashingError::BucketOutOfRange {
                bucket,
                bucket_count: self.bucket_count,
            });
        }
        Ok(())
    }

    /// Append `records` to the bucket's file. On error the file is left in
    /// whatever state the failed write produced.
    pub fn append(&self, bucket: usize, records: &[TaggedElement]) -> Result<(), HashingError> {
        self.check(bucket)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bucket_path(bucket))?;
        let mut writer = BufWriter::with_capacity(records.len().max(1) * RECORD_SIZE, file);
        for record in records {
            writer.write_all(&record.to_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Size of the bucket's file in bytes; a missing file counts as empty.
    pub fn file_len(&self, bucket: usize) -> Result<u64, HashingError> {
        self.check(bucket)?;
        match std::fs::metadata(self.bucket_path(bucket)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of whole records in the bucket's file.
    pub fn record_count(&self, bucket: usize) -> Result<u64, HashingError> {
        Ok(self.file_len(bucket)? / RECORD_SIZE as u64)
    }

    /// Open a fresh reader positioned at the start of the bucket's file.
    pub fn reader(&self, bucket: usize, batch_records: usize) -> Result<BucketReader, HashingError> {
        self.check(bucket)?;
        let file = File::open(self.bucket_path(bucket))?;
        Ok(BucketReader::new(bucket, file, batch_records))
    }

    /// Delete the bucket's file. Deleting a missing file is not an error.
    pub fn remove(&self, bucket: usize) -> Result<(), HashingError> {
        self.check(bucket)?;
        match std::fs::remove_file(self.bucket_path(bucket)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sequential batch reader over one bucket file.
pub struct BucketReader {
    bucket: usize,
    reader: BufReader<File>,
    buf: Vec<u8>,
    batch_records: usize,
    trailing_bytes: usize,
    done: bool,
}

impl BucketReader {
    fn new(bucket: usize, file: File, batch_records: usize) -> Self {
        let batch_records = batch_records.max(1);
        Self {
            bucket,
            reader: BufReader::new(file),
            buf: vec![0u8; batch_records * RECORD_SIZE],
            batch_records,
            trailing_bytes: 0,
            done: false,
        }
    }

    /// Replace the contents of `out` with the next batch of up to
    /// `batch_records` records. Returns the number read; fewer than a full
    /// batch means end of file, and `0` means nothing was left.
    pub fn next_batch(&mut self, out: &mut Vec<TaggedElement>) -> Result<usize, HashingError> {
        out.clear();
        if self.done {
            return Ok(0);
        }
        let filled = read_full(&mut self.reader, &mut self.buf)?;
        let whole = filled / RECORD_SIZE;
        out.extend(self.buf[..whole * RECORD_SIZE].chunks_exact(RECORD_SIZE).map(|chunk| {
            let mut record = [0u8; RECORD_SIZE];
            record.copy_from_slice(chunk);
            TaggedElement::from_bytes(&record)
        }));
        if whole < self.batch_records {
            self.done = true;
            self.trailing_bytes = filled % RECORD_SIZE;
            if self.trailing_bytes > 0 {
                warn!(
                    "Bucket {}: ignoring {} trailing bytes of a partial record",
                    self.bucket, self.trailing_bytes
                );
            }
        }
        Ok(whole)
    }

    /// Bytes at the end of the file that did not form a whole record.
    pub fn trailing_bytes(&self) -> usize {
        self.trailing_bytes
    }
}

impl Iterator for BucketReader {
    type Item = Result<Vec<TaggedElement>, HashingError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_records);
        match self.next_batch(&mut batch) {
            Ok(0) => None,
            Ok(_) => Some(Ok(batch)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize, seed_index: u8) -> Vec<TaggedElement> {
        (0..n)
            .map(|i| {
                let mut element = [0u8; 16];
                element[..8].copy_from_slice(&(i as u64).to_le_bytes());
                TaggedElement::new(element, seed_index)
            })
            .collect()
    }

    #[test]
    fn test_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketFileStore::create(dir.path(), 4).unwrap();
        store.append(2, &records(5, 0)).unwrap();
        store.append(2, &records(3, 1)).unwrap();
        assert_eq!(store.record_count(2).unwrap(), 8);
        assert_eq!(store.file_len(2).unwrap(), 8 * RECORD_SIZE as u64);
        assert_eq!(store.record_count(1).unwrap(), 0);
    }

    #[test]
    fn test_reader_batches_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketFileStore::create(dir.path(), 1).unwrap();
        let written = records(25, 1);
        store.append(0, &written).unwrap();

        let sizes: Vec<usize> = store
            .reader(0, 10)
            .unwrap()
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);

        // A new reader starts from the beginning again.
        let all: Vec<TaggedElement> = store
            .reader(0, 7)
            .unwrap()
            .flat_map(|b| b.unwrap())
            .collect();
        assert_eq!(all, written);
    }

    #[test]
    fn test_exact_multiple_of_batch_ends_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketFileStore::create(dir.path(), 1).unwrap();
        store.append(0, &records(20, 0)).unwrap();
        let mut reader = store.reader(0, 10).unwrap();
        let mut batch = Vec::new();
        assert_eq!(reader.next_batch(&mut batch).unwrap(), 10);
        assert_eq!(reader.next_batch(&mut batch).unwrap(), 10);
        assert_eq!(reader.next_batch(&mut batch).unwrap(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_partial_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketFileStore::create(dir.path(), 1).unwrap();
        store.append(0, &records(3, 0)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.bucket_path(0))
            .unwrap();
        file.write_all(&[0xAB; 5]).unwrap();

        let mut reader = store.reader(0, 100).unwrap();
        let mut batch = Vec::new();
        assert_eq!(reader.next_batch(&mut batch).unwrap(), 3);
        assert_eq!(reader.trailing_bytes(), 5);
    }

    #[test]
    fn test_remove_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketFileStore::create(dir.path(), 2).unwrap();
        store.append(1, &records(1, 0)).unwrap();
        store.remove(1).unwrap();
        assert!(!store.bucket_path(1).exists());
        store.remove(1).unwrap();

        assert!(matches!(
            store.append(2, &records(1, 0)),
            Err(HashingError::BucketOutOfRange { bucket: 2, .. })
        ));
    }

    #[test]
    fn test_paths() {
        let store = BucketFileStore {
            root: PathBuf::from("/data/buckets"),
            bucket_count: 16,
        };
        assert_eq!(store.bucket_path(12), PathBuf::from("/data/buckets/12"));
        assert_eq!(store.shard_path(3), PathBuf::from("/data/buckets/result3"));
    }
}
