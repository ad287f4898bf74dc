//! Reference string types: KRef, VRef, RRef, EndpointId.
//!
//! These are parsed/printed newtypes over the textual grammar of the ocap
//! kernel wire protocol, the same way `ethrex-common::types::BlockHash` wraps
//! `H256` rather than passing raw bytes around.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseRefError;

/// A kernel-wide reference: `ko<N>` (object) or `kp<N>` (promise).
///
/// There is deliberately no device variant — the spec carries no device
/// refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum KRef {
    Object(u64),
    Promise(u64),
}

impl KRef {
    pub fn object(n: u64) -> Self {
        KRef::Object(n)
    }

    pub fn promise(n: u64) -> Self {
        KRef::Promise(n)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, KRef::Object(_))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, KRef::Promise(_))
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(n) => write!(f, "ko{n}"),
            KRef::Promise(n) => write!(f, "kp{n}"),
        }
    }
}

impl FromStr for KRef {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseRefError::bad_kref(s);
        if let Some(rest) = s.strip_prefix("ko") {
            rest.parse().map(KRef::Object).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("kp") {
            rest.parse().map(KRef::Promise).map_err(|_| bad())
        } else {
            Err(bad())
        }
    }
}

impl TryFrom<String> for KRef {
    type Error = ParseRefError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KRef> for String {
    fn from(value: KRef) -> Self {
        value.to_string()
    }
}

/// A vat-local reference: `o+N`/`o-N` (object export/import) or
/// `p+N`/`p-N` (promise export/import).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VRef {
    ObjectExport(u64),
    ObjectImport(u64),
    PromiseExport(u64),
    PromiseImport(u64),
}

impl VRef {
    pub fn is_export(&self) -> bool {
        matches!(self, VRef::ObjectExport(_) | VRef::PromiseExport(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, VRef::ObjectExport(_) | VRef::ObjectImport(_))
    }
}

impl fmt::Display for VRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VRef::ObjectExport(n) => write!(f, "o+{n}"),
            VRef::ObjectImport(n) => write!(f, "o-{n}"),
            VRef::PromiseExport(n) => write!(f, "p+{n}"),
            VRef::PromiseImport(n) => write!(f, "p-{n}"),
        }
    }
}

impl FromStr for VRef {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseRefError::bad_vref(s);
        if let Some(rest) = s.strip_prefix("o+") {
            rest.parse().map(VRef::ObjectExport).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("o-") {
            rest.parse().map(VRef::ObjectImport).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("p+") {
            rest.parse().map(VRef::PromiseExport).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("p-") {
            rest.parse().map(VRef::PromiseImport).map_err(|_| bad())
        } else {
            Err(bad())
        }
    }
}

impl TryFrom<String> for VRef {
    type Error = ParseRefError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VRef> for String {
    fn from(value: VRef) -> Self {
        value.to_string()
    }
}

/// A remote-kernel-local reference, analogous to `VRef` but scoped to a
/// remote endpoint handle: `ro+N`/`ro-N`/`rp+N`/`rp-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RRef {
    ObjectExport(u64),
    ObjectImport(u64),
    PromiseExport(u64),
    PromiseImport(u64),
}

impl fmt::Display for RRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRef::ObjectExport(n) => write!(f, "ro+{n}"),
            RRef::ObjectImport(n) => write!(f, "ro-{n}"),
            RRef::PromiseExport(n) => write!(f, "rp+{n}"),
            RRef::PromiseImport(n) => write!(f, "rp-{n}"),
        }
    }
}

impl FromStr for RRef {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseRefError::bad_rref(s);
        if let Some(rest) = s.strip_prefix("ro+") {
            rest.parse().map(RRef::ObjectExport).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("ro-") {
            rest.parse().map(RRef::ObjectImport).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("rp+") {
            rest.parse().map(RRef::PromiseExport).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix("rp-") {
            rest.parse().map(RRef::PromiseImport).map_err(|_| bad())
        } else {
            Err(bad())
        }
    }
}

impl TryFrom<String> for RRef {
    type Error = ParseRefError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RRef> for String {
    fn from(value: RRef) -> Self {
        value.to_string()
    }
}

/// `v<N>` (vat), `r<N>` (remote), or the distinguished `kernel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EndpointId {
    Vat(u64),
    Remote(u64),
    Kernel,
}

impl EndpointId {
    pub fn vat(n: u64) -> Self {
        EndpointId::Vat(n)
    }

    pub fn is_vat(&self) -> bool {
        matches!(self, EndpointId::Vat(_))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(n) => write!(f, "v{n}"),
            EndpointId::Remote(n) => write!(f, "r{n}"),
            EndpointId::Kernel => write!(f, "kernel"),
        }
    }
}

impl FromStr for EndpointId {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseRefError::bad_endpoint(s);
        if s == "kernel" {
            Ok(EndpointId::Kernel)
        } else if let Some(rest) = s.strip_prefix('v') {
            rest.parse().map(EndpointId::Vat).map_err(|_| bad())
        } else if let Some(rest) = s.strip_prefix('r') {
            rest.parse().map(EndpointId::Remote).map_err(|_| bad())
        } else {
            Err(bad())
        }
    }
}

impl TryFrom<String> for EndpointId {
    type Error = ParseRefError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointId> for String {
    fn from(value: EndpointId) -> Self {
        value.to_string()
    }
}
