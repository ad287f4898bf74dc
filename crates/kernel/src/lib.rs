pub mod codec;
pub mod crank;
pub mod error;
pub mod gc;
pub mod lifecycle;
pub mod promise;
pub mod queue;
pub mod reftables;

use std::sync::Arc;

use vatkern_common::{CapData, EndpointId, KRef};
use vatkern_protocol::Endpoint;
use vatkern_storage::Store;

pub use crank::CrankLoop;
pub use error::KernelError;
pub use gc::GcActions;
pub use lifecycle::{Lifecycle, Subcluster, VatConfig, VatRecord, VatWorkerFactory};
pub use promise::{KernelPromiseRecord, PromiseMachine, PromiseResolution, PromiseState, StrandedMessage};
pub use queue::Queue;
pub use reftables::{KernelObjectRecord, RefTables, RefTag};

/// Wires every subsystem together and exposes the operations a host binary
/// needs: launch/terminate vats, send a message from outside the vat
/// graph (e.g. the bundled demo), and drive the crank loop.
#[derive(Clone)]
pub struct Kernel {
    pub store: Store,
    pub refs: RefTables,
    pub queue: Queue,
    pub promises: PromiseMachine,
    pub gc: GcActions,
    pub lifecycle: Lifecycle,
    pub crank: CrankLoop,
}

impl Kernel {
    pub fn new(store: Store, factory: Arc<dyn VatWorkerFactory>) -> Self {
        let refs = RefTables::new(store.clone());
        let queue = Queue::new(store.clone());
        let promises = PromiseMachine::new(store.clone(), refs.clone(), queue.clone());
        let gc = GcActions::new(store.clone(), refs.clone());
        let lifecycle = Lifecycle::new(
            store.clone(),
            refs.clone(),
            queue.clone(),
            promises.clone(),
            gc.clone(),
            factory,
        );
        let crank = CrankLoop::new(
            store.clone(),
            refs.clone(),
            queue.clone(),
            promises.clone(),
            gc.clone(),
            lifecycle.clone(),
        );
        Kernel {
            store,
            refs,
            queue,
            promises,
            gc,
            lifecycle,
            crank,
        }
    }

    pub async fn launch_vat(&self, config: VatConfig) -> Result<KRef, KernelError> {
        Ok(self.lifecycle.launch_vat(config).await?)
    }

    pub async fn terminate_vat(&self, vat_id: EndpointId, reason: CapData) -> Result<(), KernelError> {
        self.lifecycle.terminate_vat(vat_id, reason).await?;
        Ok(())
    }

    /// Enqueues a `send` from outside the vat graph (the kernel itself, or
    /// a bootstrapping host) without going through a vat's syscalls.
    pub fn send_from_kernel(&self, target: KRef, methargs: CapData, result: Option<KRef>) -> Result<(), KernelError> {
        self.queue.enqueue(&vatkern_common::RunQueueItem::Send {
            target,
            message: vatkern_common::Message::new(methargs, result),
        })?;
        Ok(())
    }

    /// Runs cranks until the queue and GC action list are both empty.
    /// Used by tests and the demo binary to drive a scenario to quiescence
    /// without spawning a background task.
    pub async fn run_to_quiescence(&self) -> Result<u64, KernelError> {
        let mut cranks = 0;
        while self.crank.run_one().await? {
            cranks += 1;
        }
        Ok(cranks)
    }

    pub fn endpoint_of(&self, vat_id: EndpointId) -> Option<Arc<dyn Endpoint>> {
        self.lifecycle.endpoint_of(vat_id)
    }

    /// Restart entry point (§4.8): re-opens against an already-populated
    /// store and respawns every non-terminated vat's worker. No in-flight
    /// crank is resumed — whatever crank was open when the process stopped
    /// either committed in full or left no trace, so this only needs to
    /// reattach workers before the caller resumes draining the queue.
    pub async fn resume_all_vats(&self) -> Result<(), KernelError> {
        for vat_id in self.lifecycle.known_vat_ids()? {
            self.lifecycle.resume_vat(vat_id).await?;
        }
        Ok(())
    }
}
