//! Bounded per-bucket buffers in front of the spill files.
//!
//! Each bucket has its own queue, lock and condition variable. The insert
//! that fills a queue becomes its flusher: it takes the full batch out,
//! marks the bucket as flushing, appends the batch to the bucket file
//! without holding the lock, then hands the emptied buffer back and wakes
//! any producer waiting on that bucket. Producers never insert into a
//! flushing bucket, so insert-then-flush is atomic per bucket while other
//! buckets keep accepting records.
//!
//! Failed appends are logged and counted; the queue is reset regardless and
//! the run continues. A queue growing past its capacity, or a producer
//! waiting longer than the configured timeout, aborts the run.

use crate::bucket_store::BucketFileStore;
use crate::error::HashingError;
use crate::types::TaggedElement;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct BucketQueue {
    records: Vec<TaggedElement>,
    flushing: bool,
}

struct BucketSlot {
    queue: Mutex<BucketQueue>,
    space: Condvar,
}

/// Counters describing the spills performed so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub records_enqueued: u64,
    pub flushes: u64,
    pub write_failures: u64,
    pub records_lost: u64,
    /// Largest queue length observed right after an insert.
    pub high_water_mark: usize,
}

pub struct BucketBufferPool {
    store: BucketFileStore,
    slots: Vec<BucketSlot>,
    capacity: usize,
    timeout: Option<Duration>,
    records_enqueued: AtomicU64,
    flushes: AtomicU64,
    write_failures: AtomicU64,
    records_lost: AtomicU64,
    high_water_mark: AtomicUsize,
}

impl BucketBufferPool {
    /// One queue of `capacity` records per bucket of `store`.
    pub fn new(store: BucketFileStore, capacity: usize, timeout: Option<Duration>) -> Self {
        let slots = (0..store.bucket_count())
            .map(|_| BucketSlot {
                queue: Mutex::new(BucketQueue {
                    records: Vec::with_capacity(capacity),
                    flushing: false,
                }),
                space: Condvar::new(),
            })
            .collect();
        Self {
            store,
            slots,
            capacity,
            timeout,
            records_enqueued: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            records_lost: AtomicU64::new(0),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn store(&self) -> &BucketFileStore {
        &self.store
    }

    fn slot(&self, bucket: usize) -> Result<&BucketSlot, HashingError> {
        self.slots.get(bucket).ok_or(HashingError::BucketOutOfRange {
            bucket,
            bucket_count: self.slots.len(),
        })
    }

    /// Insert a record, blocking while the bucket is being flushed. Spills
    /// the queue to disk when this insert fills it.
    pub fn enqueue(&self, bucket: usize, record: TaggedElement) -> Result<(), HashingError> {
        let slot = self.slot(bucket)?;
        let queue = slot.queue.lock().map_err(|_| HashingError::LockPoisoned)?;
        let mut queue = self.wait_while_flushing(bucket, slot, queue)?;

        queue.records.push(record);
        let len = queue.records.len();
        if len > self.capacity {
            return Err(HashingError::QueueOverflow {
                bucket,
                len,
                capacity: self.capacity,
            });
        }
        self.records_enqueued.fetch_add(1, Ordering::Relaxed);
        self.high_water_mark.fetch_max(len, Ordering::Relaxed);

        if len == self.capacity {
            let batch = std::mem::take(&mut queue.records);
            queue.flushing = true;
            drop(queue);
            self.spill(bucket, slot, batch)?;
        }
        Ok(())
    }

    /// Spill every non-empty queue regardless of its fill level.
    pub fn flush_all(&self) -> Result<(), HashingError> {
        for (bucket, slot) in self.slots.iter().enumerate() {
            let queue = slot.queue.lock().map_err(|_| HashingError::LockPoisoned)?;
            let mut queue = self.wait_while_flushing(bucket, slot, queue)?;
            if queue.records.is_empty() {
                continue;
            }
            let batch = std::mem::take(&mut queue.records);
            queue.flushing = true;
            drop(queue);
            self.spill(bucket, slot, batch)?;
        }
        Ok(())
    }

    fn wait_while_flushing<'a>(
        &self,
        bucket: usize,
        slot: &'a BucketSlot,
        mut queue: MutexGuard<'a, BucketQueue>,
    ) -> Result<MutexGuard<'a, BucketQueue>, HashingError> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        while queue.flushing {
            queue = match deadline {
                None => slot
                    .space
                    .wait(queue)
                    .map_err(|_| HashingError::LockPoisoned)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HashingError::BackpressureTimeout {
                            bucket,
                            waited: self.timeout.unwrap_or_default(),
                        });
                    }
                    slot.space
                        .wait_timeout(queue, deadline - now)
                        .map_err(|_| HashingError::LockPoisoned)?
                        .0
                }
            };
        }
        Ok(queue)
    }

    fn spill(
        &self,
        bucket: usize,
        slot: &BucketSlot,
        mut batch: Vec<TaggedElement>,
    ) -> Result<(), HashingError> {
        let result = self.store.append(bucket, &batch);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            log::error!(
                "Error writing {} records to bucket {}: {}",
                batch.len(),
                bucket,
                e
            );
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            self.records_lost
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }

        batch.clear();
        let mut queue = slot.queue.lock().map_err(|_| HashingError::LockPoisoned)?;
        queue.records = batch;
        queue.flushing = false;
        drop(queue);
        slot.space.notify_all();
        Ok(())
    }

    /// Records currently buffered for `bucket`.
    pub fn buffered(&self, bucket: usize) -> Result<usize, HashingError> {
        let slot = self.slot(bucket)?;
        let queue = slot.queue.lock().map_err(|_| HashingError::LockPoisoned)?;
        Ok(queue.records.len())
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            high_water_mark: self.high_water_mark.load(Ordering::Relaxed),
        }
    }
}
