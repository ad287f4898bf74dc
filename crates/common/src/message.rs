//! Message and run-queue item shapes (§3).

use serde::{Deserialize, Serialize};

use crate::capdata::CapData;
use crate::refs::{EndpointId, KRef};

/// `{methargs: CapData, result: KRef?}`. When `result` is present it always
/// names a fresh unresolved promise of which the sender is the initial
/// decider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub methargs: CapData,
    pub result: Option<KRef>,
}

impl Message {
    pub fn new(methargs: CapData, result: Option<KRef>) -> Self {
        Message { methargs, result }
    }
}

/// The kind of a pending GC delivery (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcActionKind {
    Drop,
    Retire,
    Abandon,
}

/// One entry of the FIFO run queue (§3 "Run-queue item").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunQueueItem {
    Send {
        target: KRef,
        message: Message,
    },
    Notify {
        endpoint: EndpointId,
        kpid: KRef,
    },
    GcAction {
        kind: GcActionKind,
        endpoint: EndpointId,
        refs: Vec<KRef>,
    },
    ReapAction {
        vat: EndpointId,
    },
}

impl RunQueueItem {
    /// Items sourced from GC bookkeeping jump the user-traffic queue (§4.3
    /// / §4.7): GC deliveries to an endpoint precede the first user
    /// delivery of each crank turn.
    pub fn is_gc_priority(&self) -> bool {
        matches!(
            self,
            RunQueueItem::GcAction { .. } | RunQueueItem::ReapAction { .. }
        )
    }
}
