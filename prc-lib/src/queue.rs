//! Per-bucket FIFO queues of requests waiting for dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::cache::{ItemId, ResultSink};
use crate::{BucketKey, RequestDescriptor};

/// A request waiting in the queue of its bucket
#[derive(Debug)]
pub(crate) struct QueueItem {
    pub(crate) id: ItemId,
    pub(crate) descriptor: RequestDescriptor,
    pub(crate) bucket: BucketKey,
    pub(crate) sink: ResultSink,
    pub(crate) enqueued_at: Instant,
    /// Attempts made so far
    pub(crate) attempt_count: u32,
    /// Earliest time of the next attempt, set while backing off
    pub(crate) not_before: Option<Instant>,
}

impl QueueItem {
    pub(crate) fn new(
        id: ItemId,
        descriptor: RequestDescriptor,
        bucket: BucketKey,
        sink: ResultSink,
    ) -> Self {
        Self {
            id,
            descriptor,
            bucket,
            sink,
            enqueued_at: Instant::now(),
            attempt_count: 0,
            not_before: None,
        }
    }
}

#[derive(Debug, Default)]
struct BucketQueue {
    items: VecDeque<QueueItem>,
    /// Whether a drain loop is running for this bucket
    draining: bool,
}

/// State of the head of a bucket queue, see [`RequestQueue::front`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Front {
    /// The queue is empty and its drain loop must stop
    Drained,
    /// The first item may be attempted now
    Ready,
    /// The first item is backing off until the given instant
    NotBefore(Instant),
}

/// Ordered queues of pending requests, one per bucket.
///
/// The queue also tracks which buckets have a drain loop, so that
/// exactly one loop runs per non-empty bucket.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    buckets: Mutex<HashMap<BucketKey, BucketQueue>>,
}

impl RequestQueue {
    fn lock(&self) -> MutexGuard<'_, HashMap<BucketKey, BucketQueue>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item to the queue of its bucket.
    ///
    /// Returns `true` if no drain loop is running for the bucket; the
    /// caller must start one.
    pub(crate) fn enqueue(&self, item: QueueItem) -> bool {
        let mut buckets = self.lock();
        let queue = buckets.entry(item.bucket.clone()).or_default();
        queue.items.push_back(item);
        let start = !queue.draining;
        queue.draining = true;
        start
    }

    /// Put an item back at the head of its bucket queue, ahead of every
    /// item that was waiting behind it
    pub(crate) fn requeue_front(&self, item: QueueItem) {
        let mut buckets = self.lock();
        let queue = buckets.entry(item.bucket.clone()).or_default();
        queue.items.push_front(item);
        queue.draining = true;
    }

    /// Inspect the head of a bucket queue.
    ///
    /// An empty queue is removed and reported as [`Front::Drained`] in the
    /// same step, so a concurrent [`Self::enqueue`] either sees the running
    /// loop or starts a new one.
    pub(crate) fn front(&self, bucket: &BucketKey) -> Front {
        let mut buckets = self.lock();
        let Some(queue) = buckets.get(bucket) else {
            return Front::Drained;
        };
        match queue.items.front() {
            None => {
                buckets.remove(bucket);
                Front::Drained
            }
            Some(item) => match item.not_before {
                Some(not_before) if not_before > Instant::now() => Front::NotBefore(not_before),
                _ => Front::Ready,
            },
        }
    }

    /// Remove and return the oldest item of a bucket
    pub(crate) fn dequeue_next(&self, bucket: &BucketKey) -> Option<QueueItem> {
        self.lock().get_mut(bucket)?.items.pop_front()
    }

    /// Withdraw an item which has not been dispatched yet.
    ///
    /// The withdrawn item is returned so it can be dropped outside any lock.
    pub(crate) fn cancel(&self, bucket: &BucketKey, id: ItemId) -> Option<QueueItem> {
        let mut buckets = self.lock();
        let queue = buckets.get_mut(bucket)?;
        let position = queue.items.iter().position(|item| item.id == id)?;
        queue.items.remove(position)
    }

    /// Hand over a bucket whose drain loop stopped without draining it.
    ///
    /// Returns `true` if items are left; the bucket stays marked as
    /// draining and the caller must start a new loop. Otherwise the bucket
    /// is removed, so the next [`Self::enqueue`] starts one.
    pub(crate) fn release(&self, bucket: &BucketKey) -> bool {
        let mut buckets = self.lock();
        match buckets.get(bucket) {
            Some(queue) if !queue.items.is_empty() => true,
            _ => {
                buckets.remove(bucket);
                false
            }
        }
    }

    /// Number of items waiting in a bucket
    pub(crate) fn len(&self, bucket: &BucketKey) -> usize {
        self.lock().get(bucket).map_or(0, |queue| queue.items.len())
    }
}
