//! CapData: the serialized value format that crosses endpoint boundaries.
//!
//! The kernel never introspects `body` — it only translates the refs named
//! in `slots` when a value crosses a c-list boundary. `CapData<R>` is
//! generic over the ref type so the same shape serves kernel-side values
//! (`CapData<KRef>`, the default alias `CapData`) and vat-side values still
//! awaiting translation (`CapData<VRef>`, aliased as `VCapData`).

use serde::{Deserialize, Serialize};

use crate::refs::{KRef, VRef};

/// A capability-safe serialized value: an opaque `body` plus the list of
/// refs it embeds by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<R = KRef> {
    pub body: String,
    pub slots: Vec<R>,
}

impl<R> CapData<R> {
    pub fn new(body: impl Into<String>, slots: Vec<R>) -> Self {
        CapData {
            body: body.into(),
            slots,
        }
    }

    /// A CapData with no embedded refs, wrapping a JSON-serializable value.
    pub fn plain<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(CapData {
            body: serde_json::to_string(value)?,
            slots: Vec::new(),
        })
    }
}

impl CapData<KRef> {
    /// CapData whose body is a single-slot reference marker, naming exactly
    /// one embedded KRef. Used when pipelining needs to test "does this
    /// resolution name a single object".
    pub fn single_slot(kref: KRef) -> Self {
        CapData {
            body: r#"{"@qclass":"slot","index":0}"#.to_owned(),
            slots: vec![kref],
        }
    }

    /// If this CapData's slots contain exactly one KRef and it is an object
    /// reference, return it. Used by promise-pipeline forwarding (§4.5).
    pub fn as_single_object_slot(&self) -> Option<KRef> {
        match self.slots.as_slice() {
            [single] if single.is_object() => Some(*single),
            _ => None,
        }
    }

    /// If this CapData's slots contain exactly one KRef and it is a promise
    /// reference, return it. Used to detect promise-to-promise resolution.
    pub fn as_single_promise_slot(&self) -> Option<KRef> {
        match self.slots.as_slice() {
            [single] if single.is_promise() => Some(*single),
            _ => None,
        }
    }
}

/// CapData as seen on the vat side of a c-list boundary, before its slots
/// have been translated from VRefs to KRefs.
pub type VCapData = CapData<VRef>;
