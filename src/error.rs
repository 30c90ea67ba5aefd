use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashingError {
    #[error("Cannot open source file {path:?}: {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue of bucket {bucket} holds {len} records, capacity is {capacity}")]
    QueueOverflow {
        bucket: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Bucket {bucket} stayed full for {waited:?}")]
    BackpressureTimeout { bucket: usize, waited: Duration },

    #[error("Bucket {bucket} out of range (bucket count {bucket_count})")]
    BucketOutOfRange { bucket: usize, bucket_count: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Bucket queue lock poisoned")]
    LockPoisoned,

    #[error("Worker pool error: {0}")]
    ThreadPool(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Table was built with hasher {expected}, got {found}")]
    HasherMismatch {
        expected: String,
        found: &'static str,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
