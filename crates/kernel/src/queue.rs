//! The FIFO run queue (§3, §4.6): persisted via `rq.<seq>` entries so a
//! crash mid-crank resumes with the queue exactly as it stood before the
//! interrupted delivery's dequeue was committed.

use tracing::trace;
use vatkern_common::RunQueueItem;
use vatkern_storage::{keys, Store, StoreError};

use crate::codec::{decode_u64, encode_u64};

/// A strictly-FIFO queue of `RunQueueItem`s, backed by the `Store`. Head
/// and tail are separate counters (`rq.head`/`rq.tail`) rather than derived
/// from scanning, so `length`/`peek` are O(1) instead of O(queue depth).
#[derive(Debug, Clone)]
pub struct Queue {
    store: Store,
}

impl Queue {
    pub fn new(store: Store) -> Self {
        Queue { store }
    }

    fn head(&self) -> Result<u64, StoreError> {
        Ok(self.store.get(keys::RQ_HEAD)?.map(|b| decode_u64(&b)).transpose()?.unwrap_or(0))
    }

    fn tail(&self) -> Result<u64, StoreError> {
        Ok(self.store.get(keys::RQ_TAIL)?.map(|b| decode_u64(&b)).transpose()?.unwrap_or(0))
    }

    /// Appends to the back of the queue.
    pub fn enqueue(&self, item: &RunQueueItem) -> Result<(), StoreError> {
        let tail = self.tail()?;
        let encoded =
            serde_json::to_vec(item).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.store.set(&keys::run_queue_item(tail), &encoded)?;
        self.store.set(keys::RQ_TAIL, &encode_u64(tail + 1))?;
        trace!(seq = tail, "enqueued run-queue item");
        Ok(())
    }

    /// Pushes onto the *front* of the queue (§4.7's `enqueue notify`
    /// immediate-delivery path for already-resolved promises skips the
    /// queue entirely, but pipelined deliveries that must run before
    /// anything already queued use this).
    pub fn enqueue_immediate(&self, item: &RunQueueItem) -> Result<(), StoreError> {
        let head = self.head()?;
        let new_head = head.wrapping_sub(1);
        let encoded =
            serde_json::to_vec(item).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.store.set(&keys::run_queue_item(new_head), &encoded)?;
        self.store.set(keys::RQ_HEAD, &encode_u64(new_head))?;
        trace!(seq = new_head, "enqueued immediate run-queue item");
        Ok(())
    }

    /// Removes and returns the front item, or `None` if the queue is empty.
    /// The caller is expected to run this as the first step of a crank, so
    /// that a crash before `Store::end_crank` leaves the item still queued.
    pub fn dequeue(&self) -> Result<Option<RunQueueItem>, StoreError> {
        let head = self.head()?;
        let tail = self.tail()?;
        if head == tail {
            return Ok(None);
        }
        let key = keys::run_queue_item(head);
        let bytes = self.store.get(&key)?;
        self.store.delete(&key)?;
        self.store.set(keys::RQ_HEAD, &encode_u64(head + 1))?;
        match bytes {
            Some(b) => {
                let item = serde_json::from_slice(&b).map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    pub fn peek(&self) -> Result<Option<RunQueueItem>, StoreError> {
        let head = self.head()?;
        let tail = self.tail()?;
        if head == tail {
            return Ok(None);
        }
        match self.store.get(&keys::run_queue_item(head))? {
            Some(b) => Ok(Some(
                serde_json::from_slice(&b).map_err(|e| StoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn length(&self) -> Result<u64, StoreError> {
        Ok(self.tail()?.saturating_sub(self.head()?))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.length()? == 0)
    }
}
