//! The `Endpoint` trait: anything the CrankLoop can deliver a `Delivery` to
//! and receive a `CrankOutcome` plus syscalls back from.

use async_trait::async_trait;

use crate::wire::{CrankOutcome, Delivery, SyscallRequest};

/// What a delivery produced: the syscalls the worker issued (in order)
/// before replying, plus its final outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryReply {
    pub syscalls: Vec<SyscallRequest>,
    pub outcome: CrankOutcome,
}

/// A single vat (or remote) worker's communication surface, abstracting
/// over whatever transport actually carries the bytes (framed stream,
/// in-process channel, ...). One crank delivers exactly once per call.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReply, EndpointError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint stream closed")]
    Closed,

    #[error("endpoint protocol error: {0}")]
    Protocol(String),
}
