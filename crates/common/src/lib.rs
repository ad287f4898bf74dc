//! Shared reference, capability-data and message types for the ocap kernel.
//!
//! Analogous to `ethrex-common`: small, dependency-light types used by every
//! other crate in the workspace, with `serde` derives so they round-trip
//! over the wire protocol in `vatkern-protocol`.

pub mod capdata;
pub mod error;
pub mod message;
pub mod refs;

pub use capdata::{CapData, VCapData};
pub use error::ParseRefError;
pub use message::{GcActionKind, Message, RunQueueItem};
pub use refs::{EndpointId, KRef, RRef, VRef};
