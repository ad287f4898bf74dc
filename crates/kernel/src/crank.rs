//! `CrankLoop` (§4.7): the scheduler. One crank dequeues a single run-queue
//! item, translates it into a delivery, hands it to the owning endpoint,
//! and commits or rolls back based on the endpoint's reply.
//!
//! Grounded on the teacher's `tokio`-driven processing-loop style
//! (`ethrex_blockchain`'s import pipeline, `ethrex_p2p`'s connection
//! tasks): the loop is a single `tokio::task::spawn`-ed async function
//! holding exclusive access to kernel state, instrumented per crank the
//! way `ethrex` instruments block import.

use tracing::{info_span, instrument, warn, Instrument};
use vatkern_common::{CapData, EndpointId, KRef, Message, RunQueueItem, VCapData, VRef};
use vatkern_protocol::{CrankOutcome, Delivery, NotifyResolution, ResolveEntry, SyscallRequest};
use vatkern_storage::Store;

use crate::error::KernelError;
use crate::gc::GcActions;
use crate::lifecycle::Lifecycle;
use crate::promise::{PromiseMachine, PromiseResolution, PromiseState};
use crate::queue::Queue;
use crate::reftables::RefTables;

/// Owns every stateful subsystem a crank touches. `run_one` performs
/// exactly one iteration of the §4.7 pseudocode; `run_forever` loops it as
/// a background task.
#[derive(Clone)]
pub struct CrankLoop {
    store: Store,
    refs: RefTables,
    queue: Queue,
    promises: PromiseMachine,
    gc: GcActions,
    lifecycle: Lifecycle,
}

impl CrankLoop {
    pub fn new(
        store: Store,
        refs: RefTables,
        queue: Queue,
        promises: PromiseMachine,
        gc: GcActions,
        lifecycle: Lifecycle,
    ) -> Self {
        CrankLoop {
            store,
            refs,
            queue,
            promises,
            gc,
            lifecycle,
        }
    }

    /// Runs cranks back to back forever. Intended to be `tokio::spawn`-ed
    /// once per kernel instance.
    pub async fn run_forever(&self) -> ! {
        loop {
            if let Err(err) = self.run_one().await {
                warn!(?err, "crank failed");
            }
        }
    }

    /// Executes exactly one crank: GC actions drain first (§4.7 priority),
    /// then at most one run-queue item. Returns `Ok(true)` if work was
    /// done, `Ok(false)` if the queue was empty (caller should back off).
    ///
    /// The crank is opened, and its `"start"` savepoint created, *before*
    /// the item is popped off its queue: both `Queue::dequeue` and
    /// `GcActions::peek`/`remove` are written as part of that first frame,
    /// so a default-abort reply (`apply_outcome` rolling all the way back
    /// to `"start"`) undoes the pop along with everything else the
    /// delivery did, leaving the item queued rather than silently
    /// dropping it — and a crash before `end_crank` has the same effect.
    pub async fn run_one(&self) -> Result<bool, KernelError> {
        if let Some((key, action)) = self.gc.peek()? {
            self.store.start_crank()?;
            self.store.create_savepoint("start")?;
            self.gc.remove(&key)?;
            self.deliver_gc_action(action).await?;
            return Ok(true);
        }

        self.store.start_crank()?;
        self.store.create_savepoint("start")?;
        let Some(item) = self.queue.dequeue()? else {
            self.store.end_crank()?;
            return Ok(false);
        };
        self.run_item(item).await?;
        Ok(true)
    }

    /// Delivers one GC action and runs whatever syscalls the vat replies
    /// with, the same as an ordinary send or notify: a `retireExports`
    /// delivery commonly comes back with a `retireImports`/`retireExports`
    /// syscall of its own (§4.3), and dropping that reply on the floor
    /// would leave the retirement half-finished. Called with the crank
    /// already open and the action already popped (see `run_one`).
    async fn deliver_gc_action(&self, action: RunQueueItem) -> Result<(), KernelError> {
        let RunQueueItem::GcAction { kind, endpoint, refs } = action else {
            self.store.end_crank()?;
            return Ok(());
        };

        let Some(vat_endpoint) = self.lifecycle.endpoint_of(endpoint) else {
            self.store.end_crank()?;
            return Ok(());
        };
        let vrefs: Vec<VRef> = refs
            .iter()
            .filter_map(|&kref| self.refs.translate_k_to_e(endpoint, kref, false).ok())
            .collect();
        let owns_all = refs
            .iter()
            .all(|&kref| self.refs.get_object(kref).map(|r| r.owner == endpoint).unwrap_or(false));
        let delivery = match kind {
            vatkern_common::GcActionKind::Drop => Delivery::DropExports { vrefs },
            vatkern_common::GcActionKind::Retire if owns_all => Delivery::RetireExports { vrefs },
            vatkern_common::GcActionKind::Retire => Delivery::RetireImports { vrefs },
            vatkern_common::GcActionKind::Abandon => Delivery::DropExports { vrefs },
        };
        let reply = vat_endpoint.deliver(delivery).await;
        let (outcome, syscalls) = match reply {
            Ok(r) => (r.outcome, r.syscalls),
            Err(_) => (CrankOutcome::default(), Vec::new()),
        };
        self.apply_outcome(endpoint, outcome, syscalls).await
    }

    #[instrument(skip(self, item), fields(item_kind = item_kind(&item)))]
    async fn run_item(&self, item: RunQueueItem) -> Result<(), KernelError> {
        match item {
            RunQueueItem::Send { target, message } => self.run_send(target, message).await,
            RunQueueItem::Notify { endpoint, kpid } => self.run_notify(endpoint, kpid).await,
            RunQueueItem::ReapAction { vat } => self.run_reap(vat).await,
            RunQueueItem::GcAction { .. } => Ok(()),
        }
    }

    async fn run_send(&self, target: KRef, message: Message) -> Result<(), KernelError> {
        // Promise targets: either parked (unresolved) or redirected
        // (resolved, §4.7 "if item.target is an unresolved promise: park").
        if target.is_promise() {
            let record = self.promises.get(target)?;
            match record.state {
                PromiseState::Unresolved => {
                    self.promises.enqueue_to_promise(target, message)?;
                    self.store.end_crank()?;
                    return Ok(());
                }
                PromiseState::Fulfilled(ref value) => {
                    if let Some(object_target) = value.as_single_object_slot() {
                        // Re-queued to the resolved target in the same
                        // crank as the original item's pop, not a rollback
                        // followed by a separate push: a rollback to
                        // "start" here would also restore the original
                        // promise-targeted item, doubling it up with the
                        // freshly translated one.
                        self.queue.enqueue_immediate(&RunQueueItem::Send {
                            target: object_target,
                            message,
                        })?;
                        self.store.end_crank()?;
                        return Ok(());
                    }
                    self.reject_message_result(&message, value.clone());
                    self.store.end_crank()?;
                    return Ok(());
                }
                PromiseState::Rejected(ref value) => {
                    self.reject_message_result(&message, value.clone());
                    self.store.end_crank()?;
                    return Ok(());
                }
            }
        }

        let object = self.refs.get_object(target)?;
        if object.revoked {
            self.reject_message_result(
                &message,
                CapData::plain(&"Revoked").unwrap_or_else(|_| CapData::new("null", vec![])),
            );
            self.store.end_crank()?;
            return Ok(());
        }
        let owner = object.owner;
        if self.lifecycle.is_terminated(owner)? {
            self.reject_message_result(
                &message,
                CapData::plain(&"vat terminated").unwrap_or_else(|_| CapData::new("null", vec![])),
            );
            self.store.end_crank()?;
            return Ok(());
        }

        let Some(endpoint) = self.lifecycle.endpoint_of(owner) else {
            self.store.rollback_to("start")?;
            self.store.end_crank()?;
            return Ok(());
        };

        self.store.create_savepoint("deliver")?;
        // Decider authority for the result promise transfers to the vat
        // being asked to answer it: the sender is only ever the *initial*
        // decider (§3), and nobody else could otherwise satisfy it.
        if let Some(result_kpid) = message.result {
            if let Ok(record) = self.promises.get(result_kpid) {
                if !record.state.is_resolved() {
                    if let Some(current_decider) = record.decider {
                        if current_decider != owner {
                            self.promises.set_decider(result_kpid, current_decider, owner)?;
                        }
                    }
                }
            }
        }
        let vtarget = self.refs.translate_k_to_e(owner, target, true)?;
        let vmethargs = self.translate_capdata_to_vat(owner, &message.methargs)?;
        let vresult = message
            .result
            .map(|kpid| self.refs.translate_k_to_e(owner, kpid, true))
            .transpose()?;

        let reply = endpoint
            .deliver(Delivery::Message {
                target: vtarget,
                methargs: vmethargs,
                result: vresult,
            })
            .instrument(info_span!("deliver", %owner))
            .await;

        let (outcome, syscalls) = match reply {
            Ok(r) => (r.outcome, r.syscalls),
            Err(_) => (
                CrankOutcome {
                    delivery_error: true,
                    abort: true,
                    consume_message: true,
                    ..CrankOutcome::default()
                },
                Vec::new(),
            ),
        };

        self.apply_outcome(owner, outcome, syscalls).await
    }

    /// Applies a worker's reply: runs its syscalls (if not aborting),
    /// rolls back per the abort/consumeMessage flags, commits, then
    /// defers any requested termination until after `endCrank`.
    async fn apply_outcome(
        &self,
        owner: EndpointId,
        outcome: CrankOutcome,
        syscalls: Vec<SyscallRequest>,
    ) -> Result<(), KernelError> {
        let mut illegal = false;
        if !outcome.abort {
            for syscall in syscalls {
                if self.run_syscall(owner, syscall).is_err() {
                    illegal = true;
                    break;
                }
            }
        }

        let should_abort = outcome.abort || illegal;
        if should_abort {
            let to_start = illegal || !outcome.consume_message;
            self.store.rollback_to(if to_start { "start" } else { "deliver" })?;
        }
        self.store.end_crank()?;

        let terminate = if illegal {
            Some((owner, true, CapData::plain(&"illegal syscall").unwrap_or_else(|_| CapData::new("null", vec![]))))
        } else {
            outcome
                .terminate
                .map(|t| (t.vat_id, t.reject, t.info))
        };

        if let Some((vat_id, _reject, info)) = terminate {
            self.lifecycle.terminate_vat(vat_id, info).await?;
        }

        Ok(())
    }

    fn run_syscall(&self, caller: EndpointId, syscall: SyscallRequest) -> Result<(), KernelError> {
        match syscall {
            SyscallRequest::Send { target, methargs, result } => {
                let ktarget = self.refs.translate_e_to_k(caller, target)?;
                let kmethargs = self.translate_capdata_to_kernel(caller, &methargs)?;
                let kresult = result
                    .map(|local| self.resolve_or_export(caller, local))
                    .transpose()?;
                self.queue.enqueue(&RunQueueItem::Send {
                    target: ktarget,
                    message: Message::new(kmethargs, kresult),
                })?;
                Ok(())
            }
            SyscallRequest::Subscribe { kpid } => {
                let kpid = self.refs.translate_e_to_k(caller, kpid)?;
                self.promises.subscribe(kpid, caller)?;
                Ok(())
            }
            SyscallRequest::Resolve { resolutions } => {
                for entry in resolutions {
                    self.resolve_one(caller, entry)?;
                }
                Ok(())
            }
            SyscallRequest::Exit { .. } => Ok(()),
            SyscallRequest::DropImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.refs.translate_e_to_k(caller, vref)?;
                    self.refs.clear_reachable(caller, kref)?;
                    self.gc.on_reachability_dropped(kref)?;
                }
                Ok(())
            }
            SyscallRequest::RetireImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.refs.translate_e_to_k(caller, vref)?;
                    if self.refs.get_reachable(caller, kref)? {
                        return Err(crate::error::RefError::StillReachable { endpoint: caller, kref }.into());
                    }
                    let hit_zero = self.refs.forget_kref(caller, kref)?;
                    if hit_zero {
                        self.gc.on_import_forgotten(caller, kref, true)?;
                    }
                }
                Ok(())
            }
            // The owner retiring its own export is an end-of-life
            // declaration, not an importer giving up one recognition: it
            // clears every remaining importer's c-list too and tells each
            // of them via `retireImports` (§4.3 rule 2), rather than just
            // decrementing `recognizable` by the one entry `caller` holds.
            SyscallRequest::RetireExports { vrefs } => {
                for vref in vrefs {
                    let kref = self.refs.translate_e_to_k(caller, vref)?;
                    let importers = self.refs.importers_of(kref)?;
                    for &importer in &importers {
                        if importer != caller {
                            self.refs.forget_kref(importer, kref)?;
                        }
                    }
                    self.refs.forget_own_export(caller, kref)?;
                    if kref.is_object() {
                        let mut record = self.refs.get_object(kref)?;
                        record.recognizable = 0;
                        self.refs.put_object(kref, &record)?;
                    }
                    self.gc.on_export_retired(caller, kref, &importers)?;
                }
                Ok(())
            }
            SyscallRequest::AbandonExports { vrefs } => {
                for vref in vrefs {
                    let kref = self.refs.translate_e_to_k(caller, vref)?;
                    self.refs.forget_kref(caller, kref)?;
                }
                Ok(())
            }
        }
    }

    fn resolve_one(&self, caller: EndpointId, entry: ResolveEntry) -> Result<(), KernelError> {
        let kpid = self.refs.translate_e_to_k(caller, entry.kpid)?;
        let kdata = self.translate_capdata_to_kernel(caller, &entry.data)?;
        let resolution = self.promises.resolve(kpid, caller, !entry.rejected, kdata)?;
        self.settle_resolution(resolution);
        Ok(())
    }

    async fn run_notify(&self, endpoint: EndpointId, kpid: KRef) -> Result<(), KernelError> {
        if self.lifecycle.is_terminated(endpoint)? {
            self.promises.ack_notify(kpid)?;
            self.store.end_crank()?;
            return Ok(());
        }
        let Some(vat_endpoint) = self.lifecycle.endpoint_of(endpoint) else {
            self.promises.ack_notify(kpid)?;
            self.store.end_crank()?;
            return Ok(());
        };
        let record = self.promises.get(kpid)?;
        let (rejected, data) = match record.state {
            PromiseState::Fulfilled(d) => (false, d),
            PromiseState::Rejected(d) => (true, d),
            PromiseState::Unresolved => {
                self.store.end_crank()?;
                return Ok(());
            }
        };
        // This `Notify` is the only thing the subscriber's reference was
        // for; releasing it now may delete the record, but everything
        // needed from it (`rejected`/`data`) has already been read.
        self.promises.ack_notify(kpid)?;
        let vkpid = self.refs.translate_k_to_e(endpoint, kpid, true)?;
        let vdata = self.translate_capdata_to_vat(endpoint, &data)?;
        let reply = vat_endpoint
            .deliver(Delivery::Notify {
                resolutions: vec![NotifyResolution {
                    kpid: vkpid,
                    rejected,
                    data: vdata,
                }],
            })
            .await;
        let (outcome, syscalls) = match reply {
            Ok(r) => (r.outcome, r.syscalls),
            Err(_) => (CrankOutcome::default(), Vec::new()),
        };
        self.apply_outcome(endpoint, outcome, syscalls).await
    }

    async fn run_reap(&self, vat: EndpointId) -> Result<(), KernelError> {
        if let Some(endpoint) = self.lifecycle.endpoint_of(vat) {
            let _ = endpoint.deliver(Delivery::BringOutYourDead).await;
        }
        self.store.end_crank()?;
        Ok(())
    }

    /// A backlogged message that lost its forwarding target (rejected
    /// promise, data resolution, or stranded pipeline entry) is reported
    /// back to its own result promise as a rejection, if it has one. The
    /// forced resolution's own subscribers/backlog are settled the same
    /// way `resolve_one` settles an ordinary one, so rejecting one message
    /// doesn't strand whoever was waiting on *its* result promise.
    fn reject_message_result(&self, message: &Message, reason: CapData) {
        let Some(result) = message.result else {
            return;
        };
        let Ok(record) = self.promises.get(result) else {
            return;
        };
        if record.state.is_resolved() {
            return;
        }
        let decider = record.decider.unwrap_or(EndpointId::Kernel);
        if let Ok(resolution) = self.promises.resolve(result, decider, false, reason) {
            self.settle_resolution(resolution);
        }
    }

    fn settle_resolution(&self, resolution: PromiseResolution) {
        for item in resolution.notifies.into_iter().chain(resolution.forwards) {
            let _ = self.queue.enqueue(&item);
        }
        for stranded in resolution.stranded {
            self.reject_message_result(&stranded.message, stranded.resolution);
        }
    }

    fn translate_capdata_to_vat(&self, endpoint: EndpointId, data: &CapData) -> Result<VCapData, KernelError> {
        let slots = data
            .slots
            .iter()
            .map(|&kref| self.refs.translate_k_to_e(endpoint, kref, true))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VCapData::new(data.body.clone(), slots))
    }

    /// CapData slots arriving from a vat may name a brand-new export the
    /// vat has never mentioned before (it invents `o+N`/`p+N` itself, §3);
    /// `resolve_or_export` is the one place that turns such a ref into a
    /// freshly-minted kernel object or promise rather than failing lookup.
    fn translate_capdata_to_kernel(&self, endpoint: EndpointId, data: &VCapData) -> Result<CapData, KernelError> {
        let slots = data
            .slots
            .iter()
            .map(|&local| self.resolve_or_export(endpoint, local))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CapData::new(data.body.clone(), slots))
    }

    /// Looks up `local` in `endpoint`'s c-list, minting a new kernel object
    /// or promise the first time the vat exports one it hasn't named
    /// before. Import-side refs (`o-N`/`p-N`) must already be bound — a
    /// vat never invents an import — so those still fail as `UnmappedRef`.
    fn resolve_or_export(&self, endpoint: EndpointId, local: VRef) -> Result<KRef, KernelError> {
        if let Ok(kref) = self.refs.translate_e_to_k(endpoint, local) {
            return Ok(kref);
        }
        match local {
            VRef::ObjectExport(_) => {
                let kref = self.refs.create_object(endpoint)?;
                self.refs.bind(endpoint, kref, local)?;
                self.refs.set_reachable(endpoint, kref, true)?;
                Ok(kref)
            }
            VRef::PromiseExport(_) => {
                let kpid = self.promises.allocate(Some(endpoint))?;
                self.refs.bind(endpoint, kpid, local)?;
                Ok(kpid)
            }
            VRef::ObjectImport(_) | VRef::PromiseImport(_) => {
                Err(crate::error::RefError::UnmappedRef { endpoint, local }.into())
            }
        }
    }
}

fn item_kind(item: &RunQueueItem) -> &'static str {
    match item {
        RunQueueItem::Send { .. } => "send",
        RunQueueItem::Notify { .. } => "notify",
        RunQueueItem::GcAction { .. } => "gc",
        RunQueueItem::ReapAction { .. } => "reap",
    }
}
