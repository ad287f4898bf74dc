//! Kernel ↔ worker wire shapes (§6). Grounded on
//! `ethrex_p2p::rlpx::message::Message` for the tagged-enum request/delivery
//! shape and on `ethrex_rpc::utils::{RpcRequest, RpcErr}` for the
//! `id`-correlated request/response envelope.

use serde::{Deserialize, Serialize};
use vatkern_common::{CapData, EndpointId, VCapData, VRef};

/// One delivery tuple sent from kernel to a vat worker (§6 `deliver.params`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Delivery {
    Message {
        target: VRef,
        methargs: VCapData,
        result: Option<VRef>,
    },
    Notify {
        resolutions: Vec<NotifyResolution>,
    },
    DropExports {
        vrefs: Vec<VRef>,
    },
    RetireExports {
        vrefs: Vec<VRef>,
    },
    RetireImports {
        vrefs: Vec<VRef>,
    },
    BringOutYourDead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResolution {
    pub kpid: VRef,
    pub rejected: bool,
    pub data: VCapData,
}

/// Envelope wrapping a `Delivery` with the JSON-RPC-style `id`/`method`
/// framing described in §6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub id: String,
    pub delivery: Delivery,
}

/// One syscall a vat worker issues back to the kernel mid-crank (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum SyscallRequest {
    Send { target: VRef, methargs: VCapData, result: Option<VRef> },
    Subscribe { kpid: VRef },
    Resolve { resolutions: Vec<ResolveEntry> },
    Exit { is_failure: bool, info: VCapData },
    DropImports { vrefs: Vec<VRef> },
    RetireImports { vrefs: Vec<VRef> },
    RetireExports { vrefs: Vec<VRef> },
    AbandonExports { vrefs: Vec<VRef> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveEntry {
    pub kpid: VRef,
    pub rejected: bool,
    pub data: VCapData,
}

/// A vat-requested termination, carried back in a `CrankOutcome` (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub vat_id: EndpointId,
    pub reject: bool,
    pub info: CapData,
}

/// The endpoint's reply to a delivery (§4.6 "Reply shape").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CrankOutcome {
    pub abort: bool,
    pub terminate: Option<TerminateRequest>,
    pub consume_message: bool,
    pub did_delivery: Option<EndpointId>,
    pub delivery_error: bool,
}

impl CrankOutcome {
    pub fn normal() -> Self {
        CrankOutcome::default()
    }

    /// Priority ranking among outcomes that can occur within a single crank
    /// (§4.6): illegal syscall outranks a worker-reported delivery error,
    /// which outranks a rejecting `exit`, which outranks a clean `exit`,
    /// which outranks a normal return. Callers compare two outcomes (e.g.
    /// one synthesized from an illegal-syscall detection, one returned by
    /// the worker) and keep the higher-priority one.
    pub fn priority(&self) -> Disposition {
        if self.delivery_error && self.abort && self.terminate.as_ref().is_some_and(|t| t.reject) {
            return Disposition::IllegalSyscall;
        }
        if self.delivery_error {
            return Disposition::DeliveryError;
        }
        match &self.terminate {
            Some(t) if t.reject => Disposition::ExitReject,
            Some(_) => Disposition::ExitNormal,
            None => Disposition::Normal,
        }
    }
}

/// Ordered from lowest to highest priority; `Ord` gives the "wins on
/// conflict" comparison directly via `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Disposition {
    Normal,
    ExitNormal,
    ExitReject,
    DeliveryError,
    IllegalSyscall,
}
