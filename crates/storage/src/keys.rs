//! Persisted key layout (§6). Grounded on
//! `ethrex_storage::api::tables` — named constants documenting the shape of
//! each key, with small builder functions instead of ad hoc string
//! formatting scattered across callers.

use vatkern_common::{EndpointId, KRef};

/// Arbitrary kernel-global values, e.g. `kv.nextObjectId`.
pub fn kv(name: &str) -> Vec<u8> {
    format!("kv.{name}").into_bytes()
}

pub const NEXT_OBJECT_ID: &str = "nextObjectId";
pub const NEXT_PROMISE_ID: &str = "nextPromiseId";
pub const NEXT_VAT_ID: &str = "nextVatId";
pub const NEXT_GC_SEQ: &str = "nextGcSeq";

/// Per-endpoint monotonic counters for import-side local ref allocation.
pub fn next_import_object_id(endpoint: EndpointId) -> Vec<u8> {
    format!("kv.{endpoint}.nextImportObjectId").into_bytes()
}

pub fn next_import_promise_id(endpoint: EndpointId) -> Vec<u8> {
    format!("kv.{endpoint}.nextImportPromiseId").into_bytes()
}

/// `clist.<endpointId>.k.<kref>` → localRef
pub fn clist_by_kref(endpoint: EndpointId, kref: KRef) -> Vec<u8> {
    format!("clist.{endpoint}.k.{kref}").into_bytes()
}

/// `clist.<endpointId>.e.<localRef>` → kref
pub fn clist_by_local(endpoint: EndpointId, local: impl std::fmt::Display) -> Vec<u8> {
    format!("clist.{endpoint}.e.{local}").into_bytes()
}

/// `clist.<endpointId>.r.<kref>` → "1" when reachable
pub fn clist_reachable(endpoint: EndpointId, kref: KRef) -> Vec<u8> {
    format!("clist.{endpoint}.r.{kref}").into_bytes()
}

/// Prefix over every c-list entry keyed by kref, for one endpoint —
/// used when an endpoint is torn down.
pub fn clist_by_kref_prefix(endpoint: EndpointId) -> Vec<u8> {
    format!("clist.{endpoint}.k.").into_bytes()
}

pub fn clist_by_local_prefix(endpoint: EndpointId) -> Vec<u8> {
    format!("clist.{endpoint}.e.").into_bytes()
}

/// `ko.<kref>.<field>`
pub fn kernel_object(kref: KRef, field: &str) -> Vec<u8> {
    format!("ko.{kref}.{field}").into_bytes()
}

pub const KO_OWNER: &str = "owner";
pub const KO_REACHABLE: &str = "reachable";
pub const KO_RECOGNIZABLE: &str = "recognizable";
pub const KO_REVOKED: &str = "revoked";
pub const KO_PINNED: &str = "pinned";

/// `kp.<kref>.<field>`
pub fn kernel_promise(kref: KRef, field: &str) -> Vec<u8> {
    format!("kp.{kref}.{field}").into_bytes()
}

pub const KP_STATE: &str = "state";
pub const KP_DECIDER: &str = "decider";
pub const KP_REFCOUNT: &str = "refcount";
pub const KP_DATA: &str = "data";
pub const KP_SUBSCRIBERS: &str = "subscribers";
pub const KP_QUEUE: &str = "queue";

/// `rq.<seq>`
pub fn run_queue_item(seq: u64) -> Vec<u8> {
    format!("rq.{seq:020}").into_bytes()
}

pub const RQ_HEAD: &[u8] = b"rq.head";
pub const RQ_TAIL: &[u8] = b"rq.tail";
pub const RQ_PREFIX: &[u8] = b"rq.";

/// `gc.<seq>`
pub fn gc_action(seq: u64) -> Vec<u8> {
    format!("gc.{seq:020}").into_bytes()
}

pub const GC_PREFIX: &[u8] = b"gc.";

/// `vat.<vatId>.config`
pub fn vat_config(vat: EndpointId) -> Vec<u8> {
    format!("vat.{vat}.config").into_bytes()
}

/// `vatstore.<vatId>.<key>`
pub fn vatstore(vat: EndpointId, key: &str) -> Vec<u8> {
    format!("vatstore.{vat}.{key}").into_bytes()
}

pub fn vatstore_prefix(vat: EndpointId) -> Vec<u8> {
    format!("vatstore.{vat}.").into_bytes()
}
