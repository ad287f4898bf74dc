//! Vat and subcluster lifecycle (§4.8): launch, termination, and bootstrap.
//!
//! `launchVat`'s "start worker via platform service" is represented as a
//! `VatWorkerFactory` trait object the caller supplies — the platform
//! service itself is out of scope, the same way `ethrex`'s `VmEngine` is
//! pluggable behind a trait while the binary wires up a concrete one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vatkern_common::{CapData, EndpointId, KRef, VRef};
use vatkern_protocol::Endpoint;
use vatkern_storage::{keys, Store, StoreError};

use crate::codec::decode_string;
use crate::error::LifecycleError;
use crate::gc::GcActions;
use crate::promise::{PromiseMachine, PromiseResolution, StrandedMessage};
use crate::queue::Queue;
use crate::reftables::RefTables;

/// Launch-time configuration for a vat, persisted under `vat.<id>.config`
/// so a restart can recover it without re-asking the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatConfig {
    pub name: String,
    pub params: serde_json::Value,
}

/// A running (or formerly running) vat's bookkeeping record.
#[derive(Debug, Clone)]
pub struct VatRecord {
    pub vat_id: EndpointId,
    pub root: KRef,
    pub config: VatConfig,
    pub terminated: bool,
}

/// The out-of-scope "platform service" that actually starts a vat worker
/// process/sandbox and hands back its `Endpoint` handle.
#[async_trait::async_trait]
pub trait VatWorkerFactory: Send + Sync {
    async fn spawn(&self, vat_id: EndpointId, config: &VatConfig) -> Result<Arc<dyn Endpoint>, LifecycleError>;

    async fn stop(&self, vat_id: EndpointId);
}

/// A named bag of vats launched together (§4.8 "Subcluster").
#[derive(Debug, Clone, Default)]
pub struct Subcluster {
    pub vats: Vec<EndpointId>,
}

#[derive(Clone)]
pub struct Lifecycle {
    store: Store,
    refs: RefTables,
    queue: Queue,
    promises: PromiseMachine,
    gc: GcActions,
    factory: Arc<dyn VatWorkerFactory>,
    endpoints: Arc<RwLock<HashMap<EndpointId, Arc<dyn Endpoint>>>>,
    subclusters: Arc<RwLock<HashMap<String, Subcluster>>>,
}

impl Lifecycle {
    pub fn new(
        store: Store,
        refs: RefTables,
        queue: Queue,
        promises: PromiseMachine,
        gc: GcActions,
        factory: Arc<dyn VatWorkerFactory>,
    ) -> Self {
        Lifecycle {
            store,
            refs,
            queue,
            promises,
            gc,
            factory,
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            subclusters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn alloc_vat_id(&self) -> Result<EndpointId, LifecycleError> {
        let key = keys::kv(keys::NEXT_VAT_ID);
        let current = self
            .store
            .get(&key)?
            .map(|b| crate::codec::decode_u64(&b))
            .transpose()?
            .unwrap_or(0);
        self.store.set(&key, &crate::codec::encode_u64(current + 1))?;
        Ok(EndpointId::vat(current))
    }

    /// Allocates a vat id, creates an empty c-list and vatstore namespace,
    /// persists the launch config, starts the worker, and returns the
    /// root object's KRef (§4.8). The root object is owned by the new vat
    /// from the moment it is created.
    pub async fn launch_vat(&self, config: VatConfig) -> Result<KRef, LifecycleError> {
        let vat_id = self.alloc_vat_id()?;
        self.store
            .set(&keys::vat_config(vat_id), &serde_json::to_vec(&config).map_err(config_err)?)?;

        let endpoint = self.factory.spawn(vat_id, &config).await?;
        self.endpoints.write().insert(vat_id, endpoint);

        // The root object is always the vat's own `o+0` export, by
        // convention, so it has a c-list entry from the moment the vat can
        // first mention it in a syscall.
        let root = self.refs.create_object(vat_id)?;
        self.refs.bind(vat_id, root, VRef::ObjectExport(0))?;
        self.refs.set_reachable(vat_id, root, true)?;
        info!(%vat_id, %root, name = %config.name, "launched vat");
        Ok(root)
    }

    pub fn endpoint_of(&self, vat_id: EndpointId) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.read().get(&vat_id).cloned()
    }

    /// Lists every vat id that has ever been launched against this store,
    /// in launch order, regardless of termination — restart (§4.8) needs
    /// this to decide which workers to respawn.
    pub fn known_vat_ids(&self) -> Result<Vec<EndpointId>, LifecycleError> {
        let mut ids: Vec<EndpointId> = Vec::new();
        for (key, _) in self.store.enumerate(b"vat.")? {
            let key_str = decode_string(&key)?;
            let parts: Vec<&str> = key_str.splitn(3, '.').collect();
            if parts.get(2) == Some(&"config") {
                if let Some(vat_str) = parts.get(1) {
                    if let Ok(vat_id) = vat_str.parse() {
                        ids.push(vat_id);
                    }
                }
            }
        }
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }

    /// Re-spawns the worker for a vat that was already launched before a
    /// restart, without reallocating its id or root object: the c-list and
    /// kernel object tables already describe it from before the crash, only
    /// the in-process `Endpoint` handle (and whatever connection the worker
    /// holds on its end) needs reattaching (§4.8 "starting their workers,
    /// and reattaching streams"). A no-op for a vat that is already
    /// terminated.
    pub async fn resume_vat(&self, vat_id: EndpointId) -> Result<(), LifecycleError> {
        if self.is_terminated(vat_id)? {
            return Ok(());
        }
        let config = self.vat_config(vat_id)?;
        let endpoint = self.factory.spawn(vat_id, &config).await?;
        self.endpoints.write().insert(vat_id, endpoint);
        info!(%vat_id, name = %config.name, "resumed vat after restart");
        Ok(())
    }

    pub fn is_terminated(&self, vat_id: EndpointId) -> Result<bool, LifecycleError> {
        Ok(self
            .store
            .get(&keys::kv(&format!("{vat_id}.terminated")))?
            .is_some())
    }

    /// Tears down a vat (§4.8): waits for crank quiescence, stops the
    /// worker, synthesizes a rejection for every promise it still decides,
    /// removes its c-list, and enqueues `retireImports` to everyone who
    /// held one of its exports.
    pub async fn terminate_vat(&self, vat_id: EndpointId, reason: CapData) -> Result<Vec<KRef>, LifecycleError> {
        self.store.wait_for_crank().await;

        self.factory.stop(vat_id).await;
        self.endpoints.write().remove(&vat_id);

        let owned = self.owned_objects(vat_id)?;
        self.gc.on_vat_terminated(vat_id, &owned)?;

        for kpid in self.decided_promises(vat_id)? {
            if let Ok(record) = self.promises.get(kpid) {
                if !record.state.is_resolved() {
                    if let Ok(resolution) = self.promises.resolve(kpid, vat_id, false, reason.clone()) {
                        self.settle_resolution(resolution);
                    }
                }
            }
        }

        self.refs.forget_all(vat_id)?;

        self.store.set(
            &keys::kv(&format!("{vat_id}.terminated")),
            &crate::codec::encode_bool(true),
        )?;

        warn!(%vat_id, "vat terminated");
        Ok(owned)
    }

    /// Forwards a forced resolution's `notify`/`forward` run-queue items to
    /// the run queue and recursively rejects whatever it stranded, mirroring
    /// `CrankLoop::resolve_one` so a vat's forced termination doesn't leave
    /// subscribers and pipelined senders waiting forever.
    fn settle_resolution(&self, resolution: PromiseResolution) {
        for item in resolution.notifies.into_iter().chain(resolution.forwards) {
            let _ = self.queue.enqueue(&item);
        }
        for stranded in resolution.stranded {
            self.reject_stranded(stranded);
        }
    }

    fn reject_stranded(&self, stranded: StrandedMessage) {
        let Some(result) = stranded.message.result else {
            return;
        };
        let Ok(record) = self.promises.get(result) else {
            return;
        };
        if record.state.is_resolved() {
            return;
        }
        let decider = record.decider.unwrap_or(EndpointId::Kernel);
        if let Ok(resolution) = self.promises.resolve(result, decider, false, stranded.resolution) {
            self.settle_resolution(resolution);
        }
    }

    fn owned_objects(&self, vat_id: EndpointId) -> Result<Vec<KRef>, LifecycleError> {
        let mut owned = Vec::new();
        for (key, value) in self.store.enumerate(b"ko.")? {
            let key_str = decode_string(&key)?;
            if !key_str.ends_with(".owner") {
                continue;
            }
            let owner_str = decode_string(&value)?;
            if owner_str == vat_id.to_string() {
                let parts: Vec<&str> = key_str.splitn(3, '.').collect();
                if let Some(kref_str) = parts.get(1) {
                    if let Ok(kref) = kref_str.parse() {
                        owned.push(kref);
                    }
                }
            }
        }
        Ok(owned)
    }

    fn decided_promises(&self, vat_id: EndpointId) -> Result<Vec<KRef>, LifecycleError> {
        let mut decided = Vec::new();
        for (key, value) in self.store.enumerate(b"kp.")? {
            let key_str = decode_string(&key)?;
            if !key_str.ends_with(".decider") {
                continue;
            }
            let decider_str = decode_string(&value)?;
            if decider_str == vat_id.to_string() {
                let parts: Vec<&str> = key_str.splitn(3, '.').collect();
                if let Some(kref_str) = parts.get(1) {
                    if let Ok(kref) = kref_str.parse() {
                        decided.push(kref);
                    }
                }
            }
        }
        Ok(decided)
    }

    /// Registers a named subcluster and sends its bootstrap message to
    /// `designated`: a map of the other members' root refs plus whatever
    /// kernel-service refs `bootstrap_extra` carries.
    pub fn register_subcluster(&self, name: impl Into<String>, vats: Vec<EndpointId>) {
        self.subclusters
            .write()
            .insert(name.into(), Subcluster { vats });
    }

    pub fn subcluster(&self, name: &str) -> Result<Subcluster, LifecycleError> {
        self.subclusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::SubclusterNotFound(name.to_owned()))
    }

    /// Terminates every vat in a subcluster in reverse launch order (§4.8).
    pub async fn terminate_subcluster(&self, name: &str, reason: CapData) -> Result<(), LifecycleError> {
        let subcluster = self.subcluster(name)?;
        for &vat_id in subcluster.vats.iter().rev() {
            self.terminate_vat(vat_id, reason.clone()).await?;
        }
        self.subclusters.write().remove(name);
        Ok(())
    }

    pub fn vat_config(&self, vat_id: EndpointId) -> Result<VatConfig, LifecycleError> {
        let bytes = self
            .store
            .get(&keys::vat_config(vat_id))?
            .ok_or(LifecycleError::VatNotFound(vat_id))?;
        serde_json::from_slice(&bytes).map_err(config_err)
    }

    /// Assembles the full bookkeeping record for introspection (the
    /// bundled binary's status command, diagnostics, tests).
    pub fn vat_record(&self, vat_id: EndpointId) -> Result<VatRecord, LifecycleError> {
        let config = self.vat_config(vat_id)?;
        let root = self.refs.translate_e_to_k(vat_id, VRef::ObjectExport(0))?;
        Ok(VatRecord {
            vat_id,
            root,
            config,
            terminated: self.is_terminated(vat_id)?,
        })
    }
}

fn config_err(e: serde_json::Error) -> LifecycleError {
    LifecycleError::Store(StoreError::Backend(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vatkern_common::CapData;
    use vatkern_protocol::{CrankOutcome, Delivery, DeliveryReply, EndpointError};
    use vatkern_storage::backend::in_memory::InMemoryBackend;

    struct NoopEndpoint;

    #[async_trait::async_trait]
    impl Endpoint for NoopEndpoint {
        async fn deliver(&self, _delivery: Delivery) -> Result<DeliveryReply, EndpointError> {
            Ok(DeliveryReply {
                syscalls: Vec::new(),
                outcome: CrankOutcome::normal(),
            })
        }
    }

    struct NoopFactory {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl VatWorkerFactory for NoopFactory {
        async fn spawn(&self, _vat_id: EndpointId, _config: &VatConfig) -> Result<Arc<dyn Endpoint>, LifecycleError> {
            Ok(Arc::new(NoopEndpoint))
        }

        async fn stop(&self, _vat_id: EndpointId) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn lifecycle() -> (Lifecycle, Arc<AtomicBool>) {
        let store = Store::new(Arc::new(InMemoryBackend::new()));
        let refs = RefTables::new(store.clone());
        let queue = Queue::new(store.clone());
        let promises = PromiseMachine::new(store.clone(), refs.clone(), queue.clone());
        let gc = GcActions::new(store.clone(), refs.clone());
        let stopped = Arc::new(AtomicBool::new(false));
        let factory = Arc::new(NoopFactory { stopped: stopped.clone() });
        (Lifecycle::new(store, refs, queue, promises, gc, factory), stopped)
    }

    #[tokio::test]
    async fn vat_record_reports_root_via_export_zero() {
        let (lc, _stopped) = lifecycle();
        let root = lc
            .launch_vat(VatConfig {
                name: "alice".to_owned(),
                params: serde_json::json!({}),
            })
            .await
            .unwrap();
        let record = lc.vat_record(EndpointId::vat(0)).unwrap();
        assert_eq!(record.root, root);
        assert_eq!(record.config.name, "alice");
        assert!(!record.terminated);
    }

    #[tokio::test]
    async fn launch_vat_allocates_distinct_ids_and_roots() {
        let (lc, _stopped) = lifecycle();
        let root1 = lc
            .launch_vat(VatConfig {
                name: "alice".to_owned(),
                params: serde_json::json!({}),
            })
            .await
            .unwrap();
        let root2 = lc
            .launch_vat(VatConfig {
                name: "bob".to_owned(),
                params: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_ne!(root1, root2);
    }

    #[tokio::test]
    async fn terminate_vat_stops_worker_and_removes_endpoint() {
        let (lc, stopped) = lifecycle();
        let _root = lc
            .launch_vat(VatConfig {
                name: "alice".to_owned(),
                params: serde_json::json!({}),
            })
            .await
            .unwrap();
        let vat_id = EndpointId::vat(0);
        assert!(lc.endpoint_of(vat_id).is_some());

        lc.terminate_vat(vat_id, CapData::plain(&"bye").unwrap())
            .await
            .unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(lc.endpoint_of(vat_id).is_none());
    }

    #[tokio::test]
    async fn terminate_vat_discards_its_own_c_list() {
        let (lc, _stopped) = lifecycle();
        let vat_id = EndpointId::vat(0);
        lc.launch_vat(VatConfig {
            name: "alice".to_owned(),
            params: serde_json::json!({}),
        })
        .await
        .unwrap();

        let ko = lc.refs.create_object(EndpointId::vat(99)).unwrap();
        lc.refs.translate_k_to_e(vat_id, ko, true).unwrap();
        assert!(lc.refs.translate_e_to_k(vat_id, VRef::ObjectImport(0)).is_ok());

        lc.terminate_vat(vat_id, CapData::plain(&"bye").unwrap())
            .await
            .unwrap();
        assert!(lc.refs.translate_e_to_k(vat_id, VRef::ObjectImport(0)).is_err());
        // The vat's own root export binding is gone too.
        assert!(lc.refs.translate_e_to_k(vat_id, VRef::ObjectExport(0)).is_err());
    }

    #[tokio::test]
    async fn subcluster_terminates_in_reverse_order() {
        let (lc, _stopped) = lifecycle();
        let mut vats = Vec::new();
        for i in 0..3 {
            lc.launch_vat(VatConfig {
                name: format!("vat{i}"),
                params: serde_json::json!({}),
            })
            .await
            .unwrap();
            vats.push(EndpointId::vat(i));
        }
        lc.register_subcluster("group", vats.clone());
        lc.terminate_subcluster("group", CapData::plain(&"shutdown").unwrap())
            .await
            .unwrap();
        for vat_id in vats {
            assert!(lc.endpoint_of(vat_id).is_none());
        }
    }

    #[tokio::test]
    async fn unknown_subcluster_errors() {
        let (lc, _stopped) = lifecycle();
        let err = lc
            .terminate_subcluster("ghost", CapData::plain(&"x").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SubclusterNotFound(_)));
    }
}
