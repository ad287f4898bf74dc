//! One error enum per concern, composed into `KernelError` — the same
//! nesting style as `ethrex_blockchain::error::ChainError` wrapping
//! `StoreError`.

use thiserror::Error;
use vatkern_common::{EndpointId, KRef, VRef};
use vatkern_storage::StoreError;

/// Failures from `RefTables` (§4.2). Every variant here except
/// `Store` corresponds to one of the "illegal syscall" triggers of §4.6 /
/// §7 when it surfaces from a vat-originated translation.
#[derive(Debug, Error)]
pub enum RefError {
    #[error("endpoint {endpoint} has no mapping for local ref {local}")]
    UnmappedRef { endpoint: EndpointId, local: VRef },

    #[error("kernel object {0} does not exist")]
    NoSuchObject(KRef),

    #[error("kernel promise {0} does not exist")]
    NoSuchPromise(KRef),

    #[error("{kref} is still reachable by {endpoint} and cannot be retired")]
    StillReachable { endpoint: EndpointId, kref: KRef },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from `PromiseMachine` (§4.5).
#[derive(Debug, Error)]
pub enum PromiseError {
    #[error("promise {0} does not exist")]
    NoSuchPromise(KRef),

    #[error("promise {0} is already resolved")]
    AlreadyResolved(KRef),

    #[error("{caller} is not the decider of promise {kpid}")]
    NotDecider { caller: EndpointId, kpid: KRef },

    #[error(transparent)]
    Ref(#[from] RefError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from `GCActions` (§4.3) — pure bookkeeping, so this is
/// deliberately small.
#[derive(Debug, Error)]
pub enum GcError {
    #[error(transparent)]
    Ref(#[from] RefError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle-level failures (§4.8, §7).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("vat {0} not found")]
    VatNotFound(EndpointId),

    #[error("subcluster '{0}' not found")]
    SubclusterNotFound(String),

    #[error(transparent)]
    Ref(#[from] RefError),

    #[error(transparent)]
    Promise(#[from] PromiseError),

    #[error(transparent)]
    Gc(#[from] GcError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error type returned by the `Kernel` facade.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Ref(#[from] RefError),

    #[error(transparent)]
    Promise(#[from] PromiseError),

    #[error(transparent)]
    Gc(#[from] GcError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("endpoint {0} is compromised and can no longer be delivered to")]
    EndpointCompromised(EndpointId),
}
