//! Small scalar (de)serialization helpers shared by every table module.
//! Store values are opaque bytes; these helpers give them the handful of
//! concrete shapes the kernel's on-disk schema (§6) actually needs.

use vatkern_storage::StoreError;

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Backend("corrupt u64 value".to_owned()))
}

pub fn encode_bool(value: bool) -> Vec<u8> {
    if value { b"1".to_vec() } else { b"0".to_vec() }
}

pub fn decode_bool(bytes: &[u8]) -> bool {
    bytes == b"1"
}

pub fn encode_str(value: impl std::fmt::Display) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub fn decode_string(bytes: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::Backend("corrupt utf8 value".to_owned()))
}
