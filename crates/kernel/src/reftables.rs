//! Per-endpoint c-lists, the kernel object table, and refcount bookkeeping
//! (§4.2). Grounded on `ethrex_storage`'s column-family-keyed layout: every
//! field lives under a prefixed key through the `Store`, so a restart
//! recovers this table with no special-cased serialization path.

use std::str::FromStr;

use tracing::trace;
use vatkern_common::{EndpointId, KRef, VRef};
use vatkern_storage::{keys, Store};

use crate::codec::{decode_bool, decode_string, decode_u64, encode_bool, encode_str, encode_u64};
use crate::error::RefError;

/// Advisory tag for refcount mutations (§4.2): affects only diagnostics, not
/// behavior, so it is carried as plain data rather than threaded through
/// every call site's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTag {
    QueueTarget,
    QueueResult,
    QueueSlot,
    Notify,
    ResolveKpid,
    ResolveSlot,
    Clist,
    Pin,
}

impl std::fmt::Display for RefTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RefTag::QueueTarget => "queue|target",
            RefTag::QueueResult => "queue|result",
            RefTag::QueueSlot => "queue|slot",
            RefTag::Notify => "notify",
            RefTag::ResolveKpid => "resolve|kpid",
            RefTag::ResolveSlot => "resolve|slot",
            RefTag::Clist => "clist",
            RefTag::Pin => "pin",
        };
        f.write_str(s)
    }
}

/// Persisted fields of a kernel object record (§3 "KernelObject record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelObjectRecord {
    pub owner: EndpointId,
    pub reachable: u64,
    pub recognizable: u64,
    pub revoked: bool,
    pub pinned: bool,
}

impl KernelObjectRecord {
    fn new(owner: EndpointId) -> Self {
        KernelObjectRecord {
            owner,
            reachable: 0,
            recognizable: 0,
            revoked: false,
            pinned: false,
        }
    }
}

/// Per-endpoint c-lists, the kernel object table, and the refcount
/// bookkeeping that both lean on. One `RefTables` wraps one `Store` handle;
/// cloning either is cheap (both are `Arc`-backed).
#[derive(Debug, Clone)]
pub struct RefTables {
    store: Store,
}

impl RefTables {
    pub fn new(store: Store) -> Self {
        RefTables { store }
    }

    fn next_id_at(&self, key: &[u8]) -> Result<u64, RefError> {
        let current = match self.store.get(key)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 0,
        };
        self.store.set(key, &encode_u64(current + 1))?;
        Ok(current)
    }

    /// Allocates the next `ko<N>` id and writes a fresh, zeroed record.
    pub fn create_object(&self, owner: EndpointId) -> Result<KRef, RefError> {
        let id = self.next_id_at(&keys::kv(keys::NEXT_OBJECT_ID))?;
        let kref = KRef::object(id);
        self.put_object(kref, &KernelObjectRecord::new(owner))?;
        trace!(%kref, %owner, "created kernel object");
        Ok(kref)
    }

    /// Allocates the next `kp<N>` id without writing a promise record —
    /// `PromiseMachine::allocate` owns the record shape and writes it.
    pub fn alloc_promise_id(&self) -> Result<KRef, RefError> {
        let id = self.next_id_at(&keys::kv(keys::NEXT_PROMISE_ID))?;
        Ok(KRef::promise(id))
    }

    pub fn get_object(&self, kref: KRef) -> Result<KernelObjectRecord, RefError> {
        let owner = self
            .store
            .get(&keys::kernel_object(kref, keys::KO_OWNER))?
            .ok_or(RefError::NoSuchObject(kref))?;
        let owner = EndpointId::from_str(&decode_string(&owner)?)
            .map_err(|_| RefError::NoSuchObject(kref))?;
        let reachable = self
            .store
            .get(&keys::kernel_object(kref, keys::KO_REACHABLE))?
            .map(|b| decode_u64(&b))
            .transpose()?
            .unwrap_or(0);
        let recognizable = self
            .store
            .get(&keys::kernel_object(kref, keys::KO_RECOGNIZABLE))?
            .map(|b| decode_u64(&b))
            .transpose()?
            .unwrap_or(0);
        let revoked = self
            .store
            .get(&keys::kernel_object(kref, keys::KO_REVOKED))?
            .is_some_and(|b| decode_bool(&b));
        let pinned = self
            .store
            .get(&keys::kernel_object(kref, keys::KO_PINNED))?
            .is_some_and(|b| decode_bool(&b));
        Ok(KernelObjectRecord {
            owner,
            reachable,
            recognizable,
            revoked,
            pinned,
        })
    }

    pub fn put_object(&self, kref: KRef, record: &KernelObjectRecord) -> Result<(), RefError> {
        self.store
            .set(&keys::kernel_object(kref, keys::KO_OWNER), &encode_str(record.owner))?;
        self.store.set(
            &keys::kernel_object(kref, keys::KO_REACHABLE),
            &encode_u64(record.reachable),
        )?;
        self.store.set(
            &keys::kernel_object(kref, keys::KO_RECOGNIZABLE),
            &encode_u64(record.recognizable),
        )?;
        self.store.set(
            &keys::kernel_object(kref, keys::KO_REVOKED),
            &encode_bool(record.revoked),
        )?;
        self.store.set(
            &keys::kernel_object(kref, keys::KO_PINNED),
            &encode_bool(record.pinned),
        )?;
        Ok(())
    }

    pub fn revoke(&self, kref: KRef) -> Result<(), RefError> {
        let mut record = self.get_object(kref)?;
        record.revoked = true;
        self.put_object(kref, &record)
    }

    pub fn pin(&self, kref: KRef) -> Result<(), RefError> {
        let mut record = self.get_object(kref)?;
        record.pinned = true;
        self.put_object(kref, &record)
    }

    // -- c-list -----------------------------------------------------------

    /// Looks up or allocates an endpoint-local ref for `kref`. Allocation
    /// (when `allocate_if_missing`) assigns the next import-side local ref
    /// and marks the object reachable (invariant 2, §3): a freshly imported
    /// ref is reachable by construction.
    pub fn translate_k_to_e(
        &self,
        endpoint: EndpointId,
        kref: KRef,
        allocate_if_missing: bool,
    ) -> Result<VRef, RefError> {
        let by_kref = keys::clist_by_kref(endpoint, kref);
        if let Some(bytes) = self.store.get(&by_kref)? {
            return VRef::from_str(&decode_string(&bytes)?)
                .map_err(|_| RefError::UnmappedRef {
                    endpoint,
                    local: VRef::ObjectImport(0),
                });
        }

        if !allocate_if_missing {
            return Err(RefError::NoSuchObject(kref));
        }

        let local = match kref {
            KRef::Object(_) => {
                let id = self.next_id_at(&keys::next_import_object_id(endpoint))?;
                VRef::ObjectImport(id)
            }
            KRef::Promise(_) => {
                let id = self.next_id_at(&keys::next_import_promise_id(endpoint))?;
                VRef::PromiseImport(id)
            }
        };

        self.bind(endpoint, kref, local)?;
        self.set_reachable(endpoint, kref, true)?;
        if kref.is_object() {
            let mut record = self.get_object(kref)?;
            record.reachable += 1;
            record.recognizable += 1;
            self.put_object(kref, &record)?;
        }
        trace!(%endpoint, %kref, %local, "allocated import");
        Ok(local)
    }

    /// Pure lookup; `UnmappedRef` if the endpoint never saw this local ref.
    pub fn translate_e_to_k(&self, endpoint: EndpointId, local: VRef) -> Result<KRef, RefError> {
        let key = keys::clist_by_local(endpoint, local);
        let bytes = self
            .store
            .get(&key)?
            .ok_or(RefError::UnmappedRef { endpoint, local })?;
        KRef::from_str(&decode_string(&bytes)?).map_err(|_| RefError::UnmappedRef { endpoint, local })
    }

    /// Establishes both directions of a c-list entry.
    pub fn bind(&self, endpoint: EndpointId, kref: KRef, local: VRef) -> Result<(), RefError> {
        self.store
            .set(&keys::clist_by_kref(endpoint, kref), &encode_str(local))?;
        self.store
            .set(&keys::clist_by_local(endpoint, local), &encode_str(kref))?;
        Ok(())
    }

    pub fn set_reachable(&self, endpoint: EndpointId, kref: KRef, reachable: bool) -> Result<(), RefError> {
        let key = keys::clist_reachable(endpoint, kref);
        if reachable {
            self.store.set(&key, b"1")?;
        } else {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    pub fn get_reachable(&self, endpoint: EndpointId, kref: KRef) -> Result<bool, RefError> {
        Ok(self.store.get(&keys::clist_reachable(endpoint, kref))?.is_some())
    }

    pub fn clear_reachable(&self, endpoint: EndpointId, kref: KRef) -> Result<(), RefError> {
        self.set_reachable(endpoint, kref, false)?;
        if kref.is_object() {
            let mut record = self.get_object(kref)?;
            record.reachable = record.reachable.saturating_sub(1);
            self.put_object(kref, &record)?;
        }
        Ok(())
    }

    /// Removes both directions of a c-list entry, decrementing
    /// recognizable. Returns `true` when recognizable hit zero, signalling
    /// the caller (`GCActions`) to enqueue a retire action.
    pub fn forget_kref(&self, endpoint: EndpointId, kref: KRef) -> Result<bool, RefError> {
        if let Some(bytes) = self.store.get(&keys::clist_by_kref(endpoint, kref))? {
            if let Ok(local) = VRef::from_str(&decode_string(&bytes)?) {
                self.store.delete(&keys::clist_by_local(endpoint, local))?;
            }
        }
        self.store.delete(&keys::clist_by_kref(endpoint, kref))?;
        self.store.delete(&keys::clist_reachable(endpoint, kref))?;

        if !kref.is_object() {
            return Ok(false);
        }
        let mut record = self.get_object(kref)?;
        record.recognizable = record.recognizable.saturating_sub(1);
        let hit_zero = record.recognizable == 0;
        self.put_object(kref, &record)?;
        Ok(hit_zero)
    }

    /// Removes an owner's own c-list entry for its export, without
    /// touching `recognizable`: the owner's self-binding (written by
    /// `launch_vat`/`resolve_or_export`) was never counted there in the
    /// first place, so this is bookkeeping cleanup, not a refcount event.
    pub fn forget_own_export(&self, endpoint: EndpointId, kref: KRef) -> Result<(), RefError> {
        if let Some(bytes) = self.store.get(&keys::clist_by_kref(endpoint, kref))? {
            if let Ok(local) = VRef::from_str(&decode_string(&bytes)?) {
                self.store.delete(&keys::clist_by_local(endpoint, local))?;
            }
        }
        self.store.delete(&keys::clist_by_kref(endpoint, kref))?;
        self.store.delete(&keys::clist_reachable(endpoint, kref))?;
        Ok(())
    }

    /// Discards every c-list entry an endpoint holds, in either direction,
    /// along with its reachability bits — the "remove c-list" step of vat
    /// termination (§4.8). Unlike `forget_kref`, this does not touch
    /// `recognizable` on the objects it unbinds: a terminated vat's
    /// imports are handled by `on_vat_terminated`'s abandon pass instead,
    /// which reasons about ownership, not importer counts.
    pub fn forget_all(&self, endpoint: EndpointId) -> Result<(), RefError> {
        for (key, _) in self.store.enumerate(&keys::clist_by_kref_prefix(endpoint))? {
            self.store.delete(&key)?;
        }
        for (key, _) in self.store.enumerate(&keys::clist_by_local_prefix(endpoint))? {
            self.store.delete(&key)?;
        }
        let reachable_prefix = format!("clist.{endpoint}.r.").into_bytes();
        for (key, _) in self.store.enumerate(&reachable_prefix)? {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    /// Every endpoint that currently holds a c-list entry naming `kref`,
    /// discovered by scanning all c-list-by-kref keys. Used when an object
    /// is retired and every importer must be told via `retireImports`.
    pub fn importers_of(&self, kref: KRef) -> Result<Vec<EndpointId>, RefError> {
        let mut importers = Vec::new();
        for (key, _) in self.store.enumerate(b"clist.")? {
            let key_str = decode_string(&key)?;
            let parts: Vec<&str> = key_str.splitn(4, '.').collect();
            if parts.len() != 4 || parts[2] != "k" {
                continue;
            }
            if parts[3] != kref.to_string() {
                continue;
            }
            if let Ok(endpoint) = EndpointId::from_str(parts[1]) {
                importers.push(endpoint);
            }
        }
        importers.sort();
        Ok(importers)
    }

    /// Advisory refcount adjustment for promise krefs (§4.2). Object krefs
    /// have no standalone refcount field in the persisted schema (§6):
    /// their liveness is already tracked by `reachable`/`recognizable`, so
    /// this is a deliberate no-op for them.
    pub fn increment_ref_count(&self, kref: KRef, tag: RefTag) -> Result<(), RefError> {
        if let KRef::Promise(_) = kref {
            let key = keys::kernel_promise(kref, keys::KP_REFCOUNT);
            let current = self.store.get(&key)?.map(|b| decode_u64(&b)).transpose()?.unwrap_or(0);
            self.store.set(&key, &encode_u64(current + 1))?;
            trace!(%kref, %tag, "refcount++");
        }
        Ok(())
    }

    pub fn decrement_ref_count(&self, kref: KRef, tag: RefTag) -> Result<(), RefError> {
        if let KRef::Promise(_) = kref {
            let key = keys::kernel_promise(kref, keys::KP_REFCOUNT);
            let current = self.store.get(&key)?.map(|b| decode_u64(&b)).transpose()?.unwrap_or(0);
            self.store.set(&key, &encode_u64(current.saturating_sub(1)))?;
            trace!(%kref, %tag, "refcount--");
        }
        Ok(())
    }

    pub fn promise_ref_count(&self, kref: KRef) -> Result<u64, RefError> {
        let key = keys::kernel_promise(kref, keys::KP_REFCOUNT);
        Ok(self.store.get(&key)?.map(|b| decode_u64(&b)).transpose()?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vatkern_storage::backend::in_memory::InMemoryBackend;

    fn tables() -> RefTables {
        let store = Store::new(Arc::new(InMemoryBackend::new()));
        RefTables::new(store)
    }

    #[test]
    fn create_object_allocates_monotonic_ids() {
        let rt = tables();
        let a = rt.create_object(EndpointId::vat(1)).unwrap();
        let b = rt.create_object(EndpointId::vat(1)).unwrap();
        assert_eq!(a, KRef::object(0));
        assert_eq!(b, KRef::object(1));
    }

    #[test]
    fn translate_k_to_e_allocates_once_and_marks_reachable() {
        let rt = tables();
        let owner = EndpointId::vat(1);
        let ko = rt.create_object(owner).unwrap();
        let importer = EndpointId::vat(2);

        let first = rt.translate_k_to_e(importer, ko, true).unwrap();
        let second = rt.translate_k_to_e(importer, ko, true).unwrap();
        assert_eq!(first, second, "repeated translation must be idempotent");
        assert!(rt.get_reachable(importer, ko).unwrap());

        let record = rt.get_object(ko).unwrap();
        assert_eq!(record.reachable, 1);
        assert_eq!(record.recognizable, 1);
    }

    #[test]
    fn translate_e_to_k_fails_on_unknown_ref() {
        let rt = tables();
        let err = rt
            .translate_e_to_k(EndpointId::vat(1), VRef::ObjectImport(99))
            .unwrap_err();
        assert!(matches!(err, RefError::UnmappedRef { .. }));
    }

    #[test]
    fn forget_kref_reports_recognizable_hitting_zero() {
        let rt = tables();
        let owner = EndpointId::vat(1);
        let ko = rt.create_object(owner).unwrap();
        let importer = EndpointId::vat(2);
        rt.translate_k_to_e(importer, ko, true).unwrap();

        let hit_zero = rt.forget_kref(importer, ko).unwrap();
        assert!(hit_zero);
        let record = rt.get_object(ko).unwrap();
        assert_eq!(record.recognizable, 0);
    }

    #[test]
    fn forget_all_clears_every_entry_for_the_endpoint() {
        let rt = tables();
        let owner = EndpointId::vat(1);
        let importer = EndpointId::vat(2);
        let a = rt.create_object(owner).unwrap();
        let b = rt.create_object(owner).unwrap();
        rt.translate_k_to_e(importer, a, true).unwrap();
        rt.translate_k_to_e(importer, b, true).unwrap();

        rt.forget_all(importer).unwrap();
        assert!(rt.translate_e_to_k(importer, VRef::ObjectImport(0)).is_err());
        assert!(rt.translate_e_to_k(importer, VRef::ObjectImport(1)).is_err());
        assert!(!rt.get_reachable(importer, a).unwrap());
        assert!(!rt.get_reachable(importer, b).unwrap());
        // The owner's own bindings are untouched by another endpoint's teardown.
        assert_eq!(rt.get_object(a).unwrap().owner, owner);
    }

    #[test]
    fn forget_own_export_does_not_touch_recognizable() {
        let rt = tables();
        let owner = EndpointId::vat(1);
        let ko = rt.create_object(owner).unwrap();
        rt.bind(owner, ko, VRef::ObjectExport(0)).unwrap();
        rt.translate_k_to_e(EndpointId::vat(2), ko, true).unwrap();

        rt.forget_own_export(owner, ko).unwrap();
        let record = rt.get_object(ko).unwrap();
        assert_eq!(record.recognizable, 1, "the importer's count is untouched");
        assert!(rt.translate_e_to_k(owner, VRef::ObjectExport(0)).is_err());
    }

    #[test]
    fn importers_of_finds_every_c_list_entry() {
        let rt = tables();
        let owner = EndpointId::vat(1);
        let ko = rt.create_object(owner).unwrap();
        rt.translate_k_to_e(EndpointId::vat(2), ko, true).unwrap();
        rt.translate_k_to_e(EndpointId::vat(3), ko, true).unwrap();

        let mut importers = rt.importers_of(ko).unwrap();
        importers.sort();
        assert_eq!(importers, vec![EndpointId::vat(2), EndpointId::vat(3)]);
    }

    #[test]
    fn promise_refcount_is_tracked_but_object_refcount_is_not() {
        let rt = tables();
        let kp = rt.alloc_promise_id().unwrap();
        rt.increment_ref_count(kp, RefTag::Clist).unwrap();
        rt.increment_ref_count(kp, RefTag::QueueResult).unwrap();
        assert_eq!(rt.promise_ref_count(kp).unwrap(), 2);
        rt.decrement_ref_count(kp, RefTag::Clist).unwrap();
        assert_eq!(rt.promise_ref_count(kp).unwrap(), 1);
    }
}
