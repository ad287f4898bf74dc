//! `GCActions` (§4.3): pure policy deriving drop/retire/abandon actions
//! from refcount transitions, queued through the same run-queue storage the
//! crank loop drains (§4.6's "GC actions run before ordinary sends").

use tracing::debug;
use vatkern_common::{EndpointId, GcActionKind, KRef, RunQueueItem};
use vatkern_storage::{keys, Store};

use crate::codec::{decode_u64, encode_u64};
use crate::error::GcError;
use crate::reftables::RefTables;

/// Derives and records GC actions. Holds no state of its own beyond the
/// shared `RefTables`/`Store` handles — every decision is a pure function
/// of the current c-list and kernel-object-table contents.
#[derive(Debug, Clone)]
pub struct GcActions {
    store: Store,
    refs: RefTables,
}

impl GcActions {
    pub fn new(store: Store, refs: RefTables) -> Self {
        GcActions { store, refs }
    }

    /// Called after an endpoint's c-list entry for `kref` is forgotten
    /// (recognizable dropped to zero, §4.2/§4.3). Orders the action
    /// `drop` before `retire`: the owning vat must hear about the drop
    /// (if it cares) before the kernel permanently frees the identifier.
    pub fn on_import_forgotten(
        &self,
        importer: EndpointId,
        kref: KRef,
        was_last_importer: bool,
    ) -> Result<(), GcError> {
        if !kref.is_object() {
            return Ok(());
        }
        let record = self.refs.get_object(kref)?;

        if record.reachable == 0 {
            self.enqueue(GcActionKind::Drop, record.owner, vec![kref])?;
        }

        if was_last_importer && record.reachable == 0 {
            self.enqueue(GcActionKind::Retire, record.owner, vec![kref])?;
        }
        let _ = importer;
        Ok(())
    }

    /// Called after `clearReachable` zeroes an importer's reachable bit
    /// (§4.3 rule 1). If the object's reachable count is now globally zero
    /// while it is still recognizable, the owner is told via `dropExports`
    /// so it can release whatever local resource backs the export; unlike
    /// `on_import_forgotten` this never enqueues `retire`, since the
    /// importer hasn't given up recognizing the object, only reaching it.
    pub fn on_reachability_dropped(&self, kref: KRef) -> Result<(), GcError> {
        if !kref.is_object() {
            return Ok(());
        }
        let record = self.refs.get_object(kref)?;
        if record.reachable == 0 && record.recognizable > 0 {
            self.enqueue(GcActionKind::Drop, record.owner, vec![kref])?;
        }
        Ok(())
    }

    /// Called when the owning vat voluntarily retires one of its exports
    /// via a `retireExports` syscall (§4.3 rule 2's importer-notification
    /// half): every other current importer is told via `retireImports` so
    /// it can drop its own recognition, symmetric with `on_vat_terminated`
    /// but triggered by the owner's own choice rather than its death.
    pub fn on_export_retired(&self, owner: EndpointId, kref: KRef, importers: &[EndpointId]) -> Result<(), GcError> {
        for &importer in importers {
            if importer != owner {
                self.enqueue(GcActionKind::Retire, importer, vec![kref])?;
            }
        }
        Ok(())
    }

    /// Called when a vat is torn down (§4.8): every object it owned that
    /// no other endpoint still imports is abandoned rather than retired —
    /// abandon leaves the kref allocated but orphaned, since retiring
    /// requires the owner to still be present to author the notification.
    /// Objects that do have surviving importers are instead retired out
    /// from under them: each importer's c-list entry is forgotten and told
    /// via a queued `retire` action, the same notification an owner's own
    /// `retireExports` would have produced, since the owner can no longer
    /// author one itself.
    pub fn on_vat_terminated(&self, vat: EndpointId, owned: &[KRef]) -> Result<(), GcError> {
        for &kref in owned {
            let importers = self.refs.importers_of(kref)?;
            if importers.is_empty() {
                debug!(%vat, %kref, "abandoning orphaned object");
                self.enqueue(GcActionKind::Abandon, vat, vec![kref])?;
                continue;
            }
            for importer in importers {
                if importer == vat {
                    continue;
                }
                self.refs.forget_kref(importer, kref)?;
                debug!(%vat, %importer, %kref, "retiring import of terminated vat's export");
                self.enqueue(GcActionKind::Retire, importer, vec![kref])?;
            }
        }
        Ok(())
    }

    fn enqueue(&self, kind: GcActionKind, endpoint: EndpointId, refs: Vec<KRef>) -> Result<(), GcError> {
        let seq = self.next_gc_seq()?;
        let item = RunQueueItem::GcAction {
            kind,
            endpoint,
            refs,
        };
        let encoded = serde_json::to_vec(&item).map_err(|e| {
            GcError::Store(vatkern_storage::StoreError::Backend(e.to_string()))
        })?;
        self.store.set(&keys::gc_action(seq), &encoded)?;
        Ok(())
    }

    fn next_gc_seq(&self) -> Result<u64, GcError> {
        let key = keys::kv(keys::NEXT_GC_SEQ);
        let current = self.store.get(&key)?.map(|b| decode_u64(&b)).transpose()?.unwrap_or(0);
        self.store.set(&key, &encode_u64(current + 1))?;
        Ok(current)
    }

    /// Returns the earliest queued GC action and its store key, without
    /// removing it. The crank loop removes it itself as the first step of
    /// the crank that delivers it (mirrors `Queue::dequeue`'s contract), so
    /// a crash before that crank's `end_crank` leaves the action still
    /// queued instead of lost.
    pub fn peek(&self) -> Result<Option<(Vec<u8>, RunQueueItem)>, GcError> {
        let mut entries = self.store.enumerate(keys::GC_PREFIX)?;
        if entries.is_empty() {
            return Ok(None);
        }
        let (key, value) = entries.remove(0);
        let item: RunQueueItem = serde_json::from_slice(&value).map_err(|e| {
            GcError::Store(vatkern_storage::StoreError::Backend(e.to_string()))
        })?;
        Ok(Some((key, item)))
    }

    /// Removes one queued action's store entry by key, as returned by
    /// `peek`.
    pub fn remove(&self, key: &[u8]) -> Result<(), GcError> {
        self.store.delete(key)?;
        Ok(())
    }

    /// Drains every queued GC action at once, in the order they were
    /// recorded. Used by tests and diagnostics; the crank loop itself goes
    /// through `peek`/`remove` one action per crank so a crash mid-batch
    /// doesn't lose whatever hadn't been delivered yet.
    pub fn drain(&self) -> Result<Vec<RunQueueItem>, GcError> {
        let entries = self.store.enumerate(keys::GC_PREFIX)?;
        let mut items = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let item: RunQueueItem = serde_json::from_slice(&value).map_err(|e| {
                GcError::Store(vatkern_storage::StoreError::Backend(e.to_string()))
            })?;
            self.store.delete(&key)?;
            items.push(item);
        }
        Ok(items)
    }

    pub fn is_empty(&self) -> Result<bool, GcError> {
        Ok(self.store.enumerate(keys::GC_PREFIX)?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vatkern_storage::backend::in_memory::InMemoryBackend;

    fn setup() -> (GcActions, RefTables) {
        let store = Store::new(Arc::new(InMemoryBackend::new()));
        let refs = RefTables::new(store.clone());
        (GcActions::new(store, refs.clone()), refs)
    }

    #[test]
    fn forgotten_import_with_no_reachability_enqueues_drop_and_retire() {
        let (gc, refs) = setup();
        let owner = EndpointId::vat(1);
        let importer = EndpointId::vat(2);
        let ko = refs.create_object(owner).unwrap();
        refs.translate_k_to_e(importer, ko, true).unwrap();
        refs.clear_reachable(importer, ko).unwrap();
        refs.forget_kref(importer, ko).unwrap();

        gc.on_import_forgotten(importer, ko, true).unwrap();
        let drained = gc.drain().unwrap();
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0],
            RunQueueItem::GcAction { kind: GcActionKind::Drop, .. }
        ));
        assert!(matches!(
            drained[1],
            RunQueueItem::GcAction { kind: GcActionKind::Retire, .. }
        ));
    }

    #[test]
    fn clearing_the_last_importer_enqueues_drop_but_not_retire() {
        let (gc, refs) = setup();
        let owner = EndpointId::vat(1);
        let importer = EndpointId::vat(2);
        let ko = refs.create_object(owner).unwrap();
        refs.translate_k_to_e(importer, ko, true).unwrap();
        refs.clear_reachable(importer, ko).unwrap();

        gc.on_reachability_dropped(ko).unwrap();
        let drained = gc.drain().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(matches!(
            drained[0],
            RunQueueItem::GcAction { kind: GcActionKind::Drop, .. }
        ));
    }

    #[test]
    fn export_retirement_notifies_every_other_importer() {
        let (gc, refs) = setup();
        let owner = EndpointId::vat(1);
        let a = EndpointId::vat(2);
        let b = EndpointId::vat(3);
        let ko = refs.create_object(owner).unwrap();
        refs.translate_k_to_e(a, ko, true).unwrap();
        refs.translate_k_to_e(b, ko, true).unwrap();

        gc.on_export_retired(owner, ko, &[owner, a, b]).unwrap();
        let drained = gc.drain().unwrap();
        assert_eq!(drained.len(), 2);
        for item in &drained {
            assert!(matches!(
                item,
                RunQueueItem::GcAction { kind: GcActionKind::Retire, endpoint, .. } if *endpoint == a || *endpoint == b
            ));
        }
    }

    #[test]
    fn vat_termination_abandons_orphaned_objects_and_retires_imported_ones() {
        let (gc, refs) = setup();
        let vat = EndpointId::vat(1);
        let importer = EndpointId::vat(2);
        let still_imported = refs.create_object(vat).unwrap();
        let orphaned = refs.create_object(vat).unwrap();
        refs.translate_k_to_e(importer, still_imported, true).unwrap();

        gc.on_vat_terminated(vat, &[still_imported, orphaned]).unwrap();
        assert!(refs.importers_of(still_imported).unwrap().is_empty());
        let drained = gc.drain().unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().any(|item| matches!(
            item,
            RunQueueItem::GcAction { kind: GcActionKind::Abandon, refs, .. } if refs == &vec![orphaned]
        )));
        assert!(drained.iter().any(|item| matches!(
            item,
            RunQueueItem::GcAction { kind: GcActionKind::Retire, endpoint, refs }
                if *endpoint == importer && refs == &vec![still_imported]
        )));
    }

    #[test]
    fn drain_is_idempotent_once_empty() {
        let (gc, _refs) = setup();
        assert!(gc.is_empty().unwrap());
        assert!(gc.drain().unwrap().is_empty());
    }
}
