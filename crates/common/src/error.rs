//! Shared error kinds, following the one-enum-per-concern style of
//! `ethrex_storage::error::StoreError` / `ethrex_blockchain::error::ChainError`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseRefError {
    #[error("'{0}' is not a valid KRef (expected ko<N> or kp<N>)")]
    BadKRef(String),
    #[error("'{0}' is not a valid VRef (expected o+N, o-N, p+N or p-N)")]
    BadVRef(String),
    #[error("'{0}' is not a valid RRef (expected ro+N, ro-N, rp+N or rp-N)")]
    BadRRef(String),
    #[error("'{0}' is not a valid EndpointId (expected v<N>, r<N> or kernel)")]
    BadEndpointId(String),
}

impl ParseRefError {
    pub fn bad_kref(s: &str) -> Self {
        ParseRefError::BadKRef(s.to_owned())
    }
    pub fn bad_vref(s: &str) -> Self {
        ParseRefError::BadVRef(s.to_owned())
    }
    pub fn bad_rref(s: &str) -> Self {
        ParseRefError::BadRRef(s.to_owned())
    }
    pub fn bad_endpoint(s: &str) -> Self {
        ParseRefError::BadEndpointId(s.to_owned())
    }
}
