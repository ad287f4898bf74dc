//! End-to-end scenario tests driving the full `Kernel` facade directly, in
//! the same spirit as `ethrex-blockchain::mempool`'s tests: an in-memory
//! `Store`, a handful of scripted vat workers wired up the same way the
//! bundled `EchoVatWorkerFactory` (`src/worker.rs`) wires a real one, and no
//! subprocess or network involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vatkern_common::{CapData, EndpointId, VCapData, VRef};
use vatkern_kernel::error::LifecycleError;
use vatkern_kernel::{Kernel, PromiseState, VatConfig, VatWorkerFactory};
use vatkern_protocol::{
    ChannelEndpoint, CrankOutcome, Delivery, DeliveryReply, Endpoint, ResolveEntry, SyscallRequest,
};
use vatkern_storage::backend::in_memory::InMemoryBackend;
use vatkern_storage::Store;

type Script = Arc<dyn Fn(Delivery) -> DeliveryReply + Send + Sync>;

/// A `VatWorkerFactory` that dispatches each launched vat's deliveries to a
/// script registered under the vat's config name, over the same
/// `ChannelEndpoint` + worker-loop shape the bundled echo worker uses. A vat
/// with no registered script gets a silent, non-aborting default reply.
#[derive(Default)]
struct ScriptedFactory {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedFactory {
    fn new() -> Self {
        ScriptedFactory::default()
    }

    fn register(&self, name: &str, script: impl Fn(Delivery) -> DeliveryReply + Send + Sync + 'static) {
        self.scripts.lock().unwrap().insert(name.to_owned(), Arc::new(script));
    }
}

#[async_trait]
impl VatWorkerFactory for ScriptedFactory {
    async fn spawn(&self, _vat_id: EndpointId, config: &VatConfig) -> Result<Arc<dyn Endpoint>, LifecycleError> {
        let script = self.scripts.lock().unwrap().get(&config.name).cloned();
        let (endpoint, mut worker_rx) = ChannelEndpoint::pair(32);
        tokio::spawn(async move {
            while let Some(request) = worker_rx.recv().await {
                let reply = match &script {
                    Some(f) => f(request.delivery),
                    None => DeliveryReply::default(),
                };
                let _ = request.reply.send(Ok(reply));
            }
        });
        Ok(Arc::new(endpoint))
    }

    async fn stop(&self, _vat_id: EndpointId) {}
}

fn vat_config(name: &str) -> VatConfig {
    VatConfig {
        name: name.to_owned(),
        params: serde_json::json!({}),
    }
}

fn kernel_with(factory: ScriptedFactory) -> Kernel {
    let store = Store::new(Arc::new(InMemoryBackend::new()));
    Kernel::new(store, Arc::new(factory))
}

fn body_of(methargs: &VCapData) -> &str {
    methargs.body.as_str()
}

// --- Scenario 1: basic send/resolve ----------------------------------------

#[tokio::test]
async fn basic_send_resolves_in_two_cranks() {
    let factory = ScriptedFactory::new();
    factory.register("bob", |delivery| match delivery {
        Delivery::Message { result: Some(result), .. } => DeliveryReply {
            syscalls: vec![SyscallRequest::Resolve {
                resolutions: vec![ResolveEntry {
                    kpid: result,
                    rejected: false,
                    data: VCapData::plain(&42i64).unwrap(),
                }],
            }],
            outcome: CrankOutcome::normal(),
        },
        _ => DeliveryReply::default(),
    });
    factory.register("alice", |_delivery| DeliveryReply {
        syscalls: vec![SyscallRequest::Send {
            target: VRef::ObjectImport(0),
            methargs: VCapData::plain(&"foo").unwrap(),
            result: Some(VRef::PromiseExport(0)),
        }],
        outcome: CrankOutcome::normal(),
    });
    let kernel = kernel_with(factory);

    let alice_root = kernel.launch_vat(vat_config("alice")).await.unwrap();
    let bob_root = kernel.launch_vat(vat_config("bob")).await.unwrap();
    let alice_id = EndpointId::vat(0);

    // Alice already holds an import of Bob's root from some earlier
    // bootstrap this scenario doesn't model.
    kernel.refs.translate_k_to_e(alice_id, bob_root, true).unwrap();

    kernel
        .send_from_kernel(alice_root, CapData::plain(&"start").unwrap(), None)
        .unwrap();

    let cranks = kernel.run_to_quiescence().await.unwrap();
    assert_eq!(cranks, 2, "alice's own send is one crank, bob's reply-and-resolve is the other");

    let kpid = kernel.refs.translate_e_to_k(alice_id, VRef::PromiseExport(0)).unwrap();
    assert!(
        kernel.promises.get(kpid).is_err(),
        "nobody subscribed and nothing was pipelined to it, so the promise's \
         refcount hit zero at resolution and its record was collected"
    );
}

// --- Scenario 2: pipelining --------------------------------------------------

#[tokio::test]
async fn pipelined_send_parks_then_forwards_once_the_promise_resolves() {
    let m2_received = Arc::new(AtomicUsize::new(0));
    let m2_received_for_script = m2_received.clone();

    let factory = ScriptedFactory::new();
    factory.register("alice", |_delivery| DeliveryReply {
        syscalls: vec![
            SyscallRequest::Send {
                target: VRef::ObjectImport(0),
                methargs: VCapData::plain(&"m1").unwrap(),
                result: Some(VRef::PromiseExport(0)),
            },
            SyscallRequest::Send {
                target: VRef::PromiseExport(0),
                methargs: VCapData::plain(&"m2").unwrap(),
                result: None,
            },
        ],
        outcome: CrankOutcome::normal(),
    });
    factory.register("bob", move |delivery| {
        let Delivery::Message { methargs, .. } = &delivery else {
            return DeliveryReply::default();
        };
        match body_of(methargs) {
            "\"m1\"" => DeliveryReply::default(),
            "\"resolve-m1\"" => DeliveryReply {
                syscalls: vec![SyscallRequest::Resolve {
                    resolutions: vec![ResolveEntry {
                        kpid: VRef::PromiseImport(0),
                        rejected: false,
                        data: VCapData::new(
                            r#"{"@qclass":"slot","index":0}"#.to_owned(),
                            vec![VRef::ObjectExport(5)],
                        ),
                    }],
                }],
                outcome: CrankOutcome::normal(),
            },
            "\"m2\"" => {
                m2_received_for_script.fetch_add(1, Ordering::SeqCst);
                DeliveryReply::default()
            }
            _ => DeliveryReply::default(),
        }
    });
    let kernel = kernel_with(factory);

    let alice_root = kernel.launch_vat(vat_config("alice")).await.unwrap();
    let bob_root = kernel.launch_vat(vat_config("bob")).await.unwrap();
    let alice_id = EndpointId::vat(0);
    let bob_id = EndpointId::vat(1);
    kernel.refs.translate_k_to_e(alice_id, bob_root, true).unwrap();

    kernel
        .send_from_kernel(alice_root, CapData::plain(&"start").unwrap(), None)
        .unwrap();

    // Crank 1: alice issues both sends (m1 to Bob's root, m2 to the result
    // promise) in the same delivery's reply.
    assert!(kernel.crank.run_one().await.unwrap());
    // Crank 2: m1 is delivered to Bob, who answers with nothing yet —
    // the result promise stays unresolved.
    assert!(kernel.crank.run_one().await.unwrap());

    let kp_m1 = kernel.refs.translate_e_to_k(bob_id, VRef::PromiseImport(0)).unwrap();
    assert_eq!(kernel.promises.get(kp_m1).unwrap().state, PromiseState::Unresolved);

    // Only now does the test ask Bob to resolve it, once it is safe to.
    kernel
        .send_from_kernel(bob_root, CapData::plain(&"resolve-m1").unwrap(), None)
        .unwrap();

    // Crank 3: m2 is dequeued while kp_m1 is still unresolved and parks.
    assert!(kernel.crank.run_one().await.unwrap());
    let parked = kernel.promises.get(kp_m1).unwrap();
    assert_eq!(parked.state, PromiseState::Unresolved);
    assert_eq!(parked.queue.len(), 1, "m2 is backlogged on the unresolved promise");

    // Crank 4: Bob resolves kp_m1 to a freshly exported object, draining
    // kp_m1's only backlog entry (m2) and releasing its last reference.
    assert!(kernel.crank.run_one().await.unwrap());
    assert!(
        kernel.promises.get(kp_m1).is_err(),
        "m2 was kp_m1's only backlog entry; forwarding it dropped kp_m1's refcount to zero"
    );

    // Crank 5: the forwarded m2 is finally delivered to Bob's new object.
    assert!(kernel.crank.run_one().await.unwrap());
    assert_eq!(m2_received.load(Ordering::SeqCst), 1);

    assert!(!kernel.crank.run_one().await.unwrap(), "nothing left to do");
}

// --- Scenario 3: drop path ----------------------------------------------------

#[tokio::test]
async fn drop_then_retire_clears_both_c_lists() {
    let factory = ScriptedFactory::new();
    factory.register("alice", |_delivery| DeliveryReply {
        syscalls: vec![SyscallRequest::DropImports {
            vrefs: vec![VRef::ObjectImport(0)],
        }],
        outcome: CrankOutcome::normal(),
    });
    factory.register("bob", |delivery| match delivery {
        Delivery::DropExports { vrefs } => DeliveryReply {
            syscalls: vec![SyscallRequest::RetireExports { vrefs }],
            outcome: CrankOutcome::normal(),
        },
        _ => DeliveryReply::default(),
    });
    let kernel = kernel_with(factory);

    let alice_root = kernel.launch_vat(vat_config("alice")).await.unwrap();
    let _bob_root = kernel.launch_vat(vat_config("bob")).await.unwrap();
    let alice_id = EndpointId::vat(0);
    let bob_id = EndpointId::vat(1);

    let ko = kernel.refs.create_object(bob_id).unwrap();
    kernel.refs.bind(bob_id, ko, VRef::ObjectExport(3)).unwrap();
    kernel.refs.translate_k_to_e(alice_id, ko, true).unwrap();

    kernel
        .send_from_kernel(alice_root, CapData::plain(&"start").unwrap(), None)
        .unwrap();

    // Crank 1: alice's own dropImports runs.
    assert!(kernel.crank.run_one().await.unwrap());
    let after_drop = kernel.refs.get_object(ko).unwrap();
    assert_eq!(after_drop.reachable, 0);
    assert_eq!(after_drop.recognizable, 1);

    // Drain whatever the GC cascade produces (dropExports to Bob, Bob's
    // retireExports cascading back, and the follow-up notification to
    // every other importer).
    kernel.run_to_quiescence().await.unwrap();

    let after_retire = kernel.refs.get_object(ko).unwrap();
    assert_eq!(after_retire.recognizable, 0);
    assert!(kernel.refs.translate_e_to_k(alice_id, VRef::ObjectImport(0)).is_err());
    assert!(kernel.refs.translate_e_to_k(bob_id, VRef::ObjectExport(3)).is_err());
}

// --- Scenario 4: illegal syscall ----------------------------------------------

#[tokio::test]
async fn retiring_a_reachable_import_terminates_the_vat_and_rejects_its_promises() {
    let factory = ScriptedFactory::new();
    factory.register("alice", |_delivery| DeliveryReply {
        syscalls: vec![SyscallRequest::RetireImports {
            vrefs: vec![VRef::ObjectImport(0)],
        }],
        outcome: CrankOutcome::normal(),
    });
    let kernel = kernel_with(factory);

    let alice_root = kernel.launch_vat(vat_config("alice")).await.unwrap();
    let alice_id = EndpointId::vat(0);

    let kp = kernel.promises.allocate(Some(alice_id)).unwrap();
    let ko = kernel.refs.create_object(EndpointId::vat(99)).unwrap();
    kernel.refs.translate_k_to_e(alice_id, ko, true).unwrap();

    kernel
        .send_from_kernel(alice_root, CapData::plain(&"start").unwrap(), None)
        .unwrap();
    kernel.run_to_quiescence().await.unwrap();

    assert!(kernel.lifecycle.is_terminated(alice_id).unwrap());
    assert!(
        kernel.promises.get(kp).is_err(),
        "kp had no subscribers or backlog, so rejecting it during termination collected the record"
    );
    assert!(kernel.refs.translate_e_to_k(alice_id, VRef::ObjectImport(0)).is_err());
    assert!(kernel.refs.translate_e_to_k(alice_id, VRef::ObjectExport(0)).is_err());
}

// --- Scenario 5: revocation ----------------------------------------------------

#[tokio::test]
async fn revoked_object_rejects_new_sends_but_preserves_other_references() {
    let kernel = kernel_with(ScriptedFactory::new());

    let owner = EndpointId::vat(1);
    let a = EndpointId::vat(2);
    let other = EndpointId::vat(3);
    let ko = kernel.refs.create_object(owner).unwrap();
    kernel.refs.translate_k_to_e(a, ko, true).unwrap();
    kernel.refs.translate_k_to_e(other, ko, true).unwrap();

    kernel.refs.revoke(ko).unwrap();

    let result = kernel.promises.allocate(Some(EndpointId::Kernel)).unwrap();
    kernel
        .send_from_kernel(ko, CapData::plain(&"m").unwrap(), Some(result))
        .unwrap();

    let cranks = kernel.run_to_quiescence().await.unwrap();
    assert_eq!(cranks, 1, "revocation is checked before any delivery is attempted");

    assert!(
        kernel.promises.get(result).is_err(),
        "result had no subscribers or backlog, so rejecting it on revocation collected the record"
    );

    let preserved = kernel.refs.get_object(ko).unwrap();
    assert!(preserved.revoked);
    assert_eq!(
        kernel.refs.translate_e_to_k(other, VRef::ObjectImport(0)).unwrap(),
        ko,
        "the other importer's binding is untouched"
    );
}

// --- Scenario 6: restart --------------------------------------------------------

#[tokio::test]
async fn restart_resumes_the_committed_queue_and_redelivers_the_in_flight_message_once() {
    let backend = Arc::new(InMemoryBackend::new());

    let factory1 = ScriptedFactory::new();
    factory1.register("bob", |delivery| match delivery {
        Delivery::Message { result: Some(result), .. } => DeliveryReply {
            syscalls: vec![SyscallRequest::Resolve {
                resolutions: vec![ResolveEntry {
                    kpid: result,
                    rejected: false,
                    data: VCapData::plain(&"pong").unwrap(),
                }],
            }],
            outcome: CrankOutcome::normal(),
        },
        _ => DeliveryReply::default(),
    });
    let store1 = Store::new(backend.clone());
    let kernel1 = Kernel::new(store1.clone(), Arc::new(factory1));

    kernel1.launch_vat(vat_config("alice")).await.unwrap();
    let bob_root = kernel1.launch_vat(vat_config("bob")).await.unwrap();
    kernel1.launch_vat(vat_config("carol")).await.unwrap();
    kernel1
        .lifecycle
        .register_subcluster("cluster", vec![EndpointId::vat(0), EndpointId::vat(1), EndpointId::vat(2)]);

    // One bootstrap round, fully committed.
    let result = kernel1.promises.allocate(Some(EndpointId::Kernel)).unwrap();
    kernel1
        .send_from_kernel(bob_root, CapData::plain(&"ping").unwrap(), Some(result))
        .unwrap();
    kernel1.run_to_quiescence().await.unwrap();
    assert!(
        kernel1.promises.get(result).is_err(),
        "result had no subscribers or backlog, so resolving it collected the record"
    );

    // A second message is committed to the queue...
    kernel1
        .send_from_kernel(bob_root, CapData::plain(&"second").unwrap(), None)
        .unwrap();

    // ...then the process crashes mid-crank, after the dequeue but before
    // `endCrank` ever runs.
    kernel1.store.start_crank().unwrap();
    kernel1.store.create_savepoint("start").unwrap();
    assert!(kernel1.queue.dequeue().unwrap().is_some());
    drop(kernel1);

    // Restart: a fresh Store/Kernel pair over the same backend sees every
    // committed write, but none of the in-flight crank's bookkeeping.
    let second_received = Arc::new(AtomicUsize::new(0));
    let second_received_for_script = second_received.clone();
    let factory2 = ScriptedFactory::new();
    factory2.register("bob", move |delivery| {
        if let Delivery::Message { methargs, .. } = &delivery {
            if body_of(methargs) == "\"second\"" {
                second_received_for_script.fetch_add(1, Ordering::SeqCst);
            }
        }
        DeliveryReply::default()
    });
    let store2 = Store::new(backend.clone());
    let kernel2 = Kernel::new(store2, Arc::new(factory2));

    kernel2.resume_all_vats().await.unwrap();
    kernel2.run_to_quiescence().await.unwrap();

    assert_eq!(second_received.load(Ordering::SeqCst), 1, "redelivered exactly once");
    assert!(
        kernel2.promises.get(result).is_err(),
        "result's collection committed before the crash and survives the restart"
    );
}
