//! `PromiseMachine` (§4.5): promise allocation, deciders, subscriptions,
//! resolution, and the queued-message handoff that realizes pipelining.
//!
//! Grounded on `ethrex_blockchain::Mempool`'s `RwLock`-guarded inner state
//! plus `tokio::sync::Notify` pattern for "wake whoever's waiting", adapted
//! here to per-promise subscriber fan-out recorded in the `Store` rather
//! than in-memory, so it survives a restart.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vatkern_common::{CapData, EndpointId, KRef, Message, RunQueueItem};
use vatkern_storage::{keys, Store, StoreError};

use crate::codec::{decode_string, encode_str};
use crate::error::PromiseError;
use crate::queue::Queue;
use crate::reftables::{RefTag, RefTables};

/// A promise's resolution state (§3 "KernelPromise record").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseState {
    Unresolved,
    Fulfilled(CapData),
    Rejected(CapData),
}

impl PromiseState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PromiseState::Unresolved)
    }
}

/// The decider and message backlog of an unresolved promise, plus its
/// current state once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPromiseRecord {
    pub state: PromiseState,
    pub decider: Option<EndpointId>,
    pub subscribers: Vec<EndpointId>,
    /// Messages sent to this promise before it resolved (§4.5
    /// pipelining): delivered to the eventual resolution target once
    /// known, in the order they arrived.
    pub queue: Vec<Message>,
}

impl KernelPromiseRecord {
    fn new(decider: Option<EndpointId>) -> Self {
        KernelPromiseRecord {
            state: PromiseState::Unresolved,
            decider,
            subscribers: Vec::new(),
            queue: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromiseMachine {
    store: Store,
    refs: RefTables,
    queue: Queue,
}

impl PromiseMachine {
    pub fn new(store: Store, refs: RefTables, queue: Queue) -> Self {
        PromiseMachine { store, refs, queue }
    }

    /// Allocates a fresh unresolved promise with `decider` as its initial
    /// authority (§3: the sender of a message carrying `result`).
    pub fn allocate(&self, decider: Option<EndpointId>) -> Result<KRef, PromiseError> {
        let kpid = self.refs.alloc_promise_id()?;
        self.put(kpid, &KernelPromiseRecord::new(decider))?;
        debug!(%kpid, ?decider, "allocated promise");
        Ok(kpid)
    }

    fn put(&self, kpid: KRef, record: &KernelPromiseRecord) -> Result<(), PromiseError> {
        let state_bytes = serde_json::to_vec(&record.state)
            .map_err(|e| PromiseError::Store(StoreError::Backend(e.to_string())))?;
        self.store
            .set(&keys::kernel_promise(kpid, keys::KP_STATE), &state_bytes)?;
        match record.decider {
            Some(d) => self
                .store
                .set(&keys::kernel_promise(kpid, keys::KP_DECIDER), &encode_str(d))?,
            None => self.store.delete(&keys::kernel_promise(kpid, keys::KP_DECIDER))?,
        }
        let subs = serde_json::to_vec(&record.subscribers)
            .map_err(|e| PromiseError::Store(StoreError::Backend(e.to_string())))?;
        self.store
            .set(&keys::kernel_promise(kpid, keys::KP_SUBSCRIBERS), &subs)?;
        let queued = serde_json::to_vec(&record.queue)
            .map_err(|e| PromiseError::Store(StoreError::Backend(e.to_string())))?;
        self.store
            .set(&keys::kernel_promise(kpid, keys::KP_QUEUE), &queued)?;
        Ok(())
    }

    pub fn get(&self, kpid: KRef) -> Result<KernelPromiseRecord, PromiseError> {
        let state_bytes = self
            .store
            .get(&keys::kernel_promise(kpid, keys::KP_STATE))?
            .ok_or(PromiseError::NoSuchPromise(kpid))?;
        let state: PromiseState = serde_json::from_slice(&state_bytes)
            .map_err(|e| PromiseError::Store(StoreError::Backend(e.to_string())))?;
        let decider = self
            .store
            .get(&keys::kernel_promise(kpid, keys::KP_DECIDER))?
            .map(|b| decode_string(&b))
            .transpose()?
            .and_then(|s| s.parse().ok());
        let subscribers = self
            .store
            .get(&keys::kernel_promise(kpid, keys::KP_SUBSCRIBERS))?
            .map(|b| serde_json::from_slice(&b))
            .transpose()
            .map_err(|e| PromiseError::Store(StoreError::Backend(e.to_string())))?
            .unwrap_or_default();
        let queue = self
            .store
            .get(&keys::kernel_promise(kpid, keys::KP_QUEUE))?
            .map(|b| serde_json::from_slice(&b))
            .transpose()
            .map_err(|e| PromiseError::Store(StoreError::Backend(e.to_string())))?
            .unwrap_or_default();
        Ok(KernelPromiseRecord {
            state,
            decider,
            subscribers,
            queue,
        })
    }

    /// Transfers decider authority, e.g. when a method call returns a
    /// promise to its caller (§4.5 "the callee becomes decider of the
    /// result promise of its own onward sends").
    pub fn set_decider(&self, kpid: KRef, caller: EndpointId, new_decider: EndpointId) -> Result<(), PromiseError> {
        let mut record = self.get(kpid)?;
        if record.state.is_resolved() {
            return Err(PromiseError::AlreadyResolved(kpid));
        }
        if record.decider != Some(caller) {
            return Err(PromiseError::NotDecider { caller, kpid });
        }
        record.decider = Some(new_decider);
        self.put(kpid, &record)
    }

    /// Records that `endpoint` wants a `Notify` run-queue entry once this
    /// promise settles. If already resolved, enqueues the notification
    /// immediately instead of waiting (§4.5).
    pub fn subscribe(&self, kpid: KRef, endpoint: EndpointId) -> Result<(), PromiseError> {
        let mut record = self.get(kpid)?;
        if record.state.is_resolved() {
            // This notification owes the record a reference of its own,
            // released by `ack_notify` once the crank loop delivers it —
            // otherwise a concurrently-deleted record (its last other
            // reference dropping in the same crank) would vanish before
            // this `Notify` is ever processed.
            self.refs.increment_ref_count(kpid, RefTag::Notify)?;
            self.queue.enqueue(&RunQueueItem::Notify { endpoint, kpid })?;
            return Ok(());
        }
        if !record.subscribers.contains(&endpoint) {
            record.subscribers.push(endpoint);
            self.refs.increment_ref_count(kpid, RefTag::Notify)?;
            self.put(kpid, &record)?;
        }
        Ok(())
    }

    /// Releases the `Notify` reference a subscriber's notification held,
    /// once the crank loop has delivered it (§4.2): called from
    /// `CrankLoop::run_notify` rather than at resolution time, since the
    /// record must still exist when the notification is actually read.
    pub fn ack_notify(&self, kpid: KRef) -> Result<(), PromiseError> {
        self.refs.decrement_ref_count(kpid, RefTag::Notify)?;
        self.delete_if_garbage(kpid)
    }

    /// Appends a message to an unresolved promise's backlog (§4.5
    /// pipelining: `sendOnly kp42.foo()` before `kp42` resolves). Once the
    /// promise resolves, these drain to the resolution target in order.
    pub fn enqueue_to_promise(&self, kpid: KRef, message: Message) -> Result<(), PromiseError> {
        let mut record = self.get(kpid)?;
        if record.state.is_resolved() {
            return Err(PromiseError::AlreadyResolved(kpid));
        }
        self.refs.increment_ref_count(kpid, RefTag::QueueTarget)?;
        record.queue.push(message);
        self.put(kpid, &record)
    }

    /// Resolves `kpid` to fulfilled(`value`) or rejected(`value`) depending
    /// on `fulfilled`. Returns the run-queue items the caller (the crank
    /// loop) must enqueue: one `Notify` per subscriber plus, for every
    /// backlogged message, either a forwarding `Send` (value resolves to
    /// an object) or nothing further (value resolves to data/rejection —
    /// those backlogged sends become illegal and are reported back to
    /// their own senders as rejections by the caller).
    ///
    /// If `value` is itself a lone promise reference, this does not
    /// speculatively forward the backlog to it (Open Question, §4.5
    /// resolved): the backlog is instead drained as rejections carrying a
    /// "forward to the new promise yourself" marker, and the caller must
    /// re-subscribe if it still cares.
    pub fn resolve(
        &self,
        kpid: KRef,
        caller: EndpointId,
        fulfilled: bool,
        value: CapData,
    ) -> Result<PromiseResolution, PromiseError> {
        let mut record = self.get(kpid)?;
        if record.state.is_resolved() {
            return Err(PromiseError::AlreadyResolved(kpid));
        }
        if record.decider != Some(caller) {
            return Err(PromiseError::NotDecider { caller, kpid });
        }

        let forwarded_to_promise = value.as_single_promise_slot().filter(|_| fulfilled);

        record.state = if fulfilled {
            PromiseState::Fulfilled(value.clone())
        } else {
            PromiseState::Rejected(value.clone())
        };

        let notifies = record
            .subscribers
            .iter()
            .map(|&endpoint| RunQueueItem::Notify { endpoint, kpid })
            .collect();

        let backlog = std::mem::take(&mut record.queue);
        record.subscribers.clear();
        self.put(kpid, &record)?;

        // The drained backlog has been turned into either a forward or a
        // stranded rejection and needs nothing further from this record, so
        // its reference is released now (§4.2). Each cleared subscriber's
        // reference stays held a little longer: it is only released once
        // the crank loop actually delivers its queued `Notify` (see
        // `ack_notify`), since the record must still exist for that.
        for _ in 0..backlog.len() {
            self.refs.decrement_ref_count(kpid, RefTag::QueueTarget)?;
        }
        self.delete_if_garbage(kpid)?;

        let target_object = if fulfilled { value.as_single_object_slot() } else { None };

        let (forwards, stranded) = match target_object {
            Some(target) => (
                backlog
                    .into_iter()
                    .map(|message| RunQueueItem::Send { target, message })
                    .collect(),
                Vec::new(),
            ),
            None => (Vec::new(), backlog_into_stranded(&backlog, fulfilled, &value)),
        };

        if let Some(forwarded) = forwarded_to_promise {
            warn!(%kpid, forwarded_to = %forwarded, "promise resolved to another promise; backlog not speculatively forwarded");
        }

        Ok(PromiseResolution {
            notifies,
            forwards,
            stranded,
        })
    }

    /// Deletes `kpid`'s record once it is resolved and nothing references
    /// it anymore (§3 Invariant 5): a resolved promise with a zero refcount
    /// can never be subscribed to or sent to again, so there is nothing
    /// left for the record to serve.
    fn delete_if_garbage(&self, kpid: KRef) -> Result<(), PromiseError> {
        let record = self.get(kpid)?;
        if record.state.is_resolved() && self.refs.promise_ref_count(kpid)? == 0 {
            self.delete(kpid)?;
        }
        Ok(())
    }

    fn delete(&self, kpid: KRef) -> Result<(), PromiseError> {
        self.store.delete(&keys::kernel_promise(kpid, keys::KP_STATE))?;
        self.store.delete(&keys::kernel_promise(kpid, keys::KP_DECIDER))?;
        self.store.delete(&keys::kernel_promise(kpid, keys::KP_SUBSCRIBERS))?;
        self.store.delete(&keys::kernel_promise(kpid, keys::KP_QUEUE))?;
        self.store.delete(&keys::kernel_promise(kpid, keys::KP_REFCOUNT))?;
        debug!(%kpid, "deleted garbage-collected promise record");
        Ok(())
    }
}

fn backlog_into_stranded(backlog: &[Message], fulfilled: bool, value: &CapData) -> Vec<StrandedMessage> {
    backlog
        .iter()
        .cloned()
        .map(|message| StrandedMessage {
            message,
            fulfilled,
            resolution: value.clone(),
        })
        .collect()
}

/// A backlogged message that could not be forwarded as an ordinary `Send`
/// because the promise resolved to data, a rejection, or another promise.
/// The crank loop turns each of these into a rejection delivered to the
/// original sender rather than silently dropping it.
#[derive(Debug, Clone)]
pub struct StrandedMessage {
    pub message: Message,
    pub fulfilled: bool,
    pub resolution: CapData,
}

/// What a resolution produced, for the crank loop to enqueue.
#[derive(Debug, Clone, Default)]
pub struct PromiseResolution {
    pub notifies: Vec<RunQueueItem>,
    pub forwards: Vec<RunQueueItem>,
    pub stranded: Vec<StrandedMessage>,
}
