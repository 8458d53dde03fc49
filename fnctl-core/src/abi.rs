//! Contract between the host and `module` functions compiled to WebAssembly.
//!
//! The guest exports `memory`, `fnctl_alloc(len: i32) -> i32` and one or more handlers with the
//! signature `(ptr: i32, len: i32) -> i64`. The host writes a JSON encoded [`GuestPayload`] into a
//! buffer returned by `fnctl_alloc` and calls the handler. The handler returns a pointer and length
//! packed into one `i64` (see [`pack_ptr_len`]) that points to a JSON encoded [`GuestOutput`].

use {
    serde::{Serialize, Deserialize},
    serde_json::Value,
    crate::event::{Context, Event},
};

pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_ALLOC: &str = "fnctl_alloc";

/// Also used as stdin payload for `exec` functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestPayload {
    pub event: Event,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOutput {
    Ok(Value),
    Err(String),
}

pub fn pack_ptr_len(ptr: u32, len: u32) -> i64 {
    (((ptr as u64) << 32) | len as u64) as i64
}

pub fn unpack_ptr_len(packed: i64) -> (u32, u32) {
    let packed = packed as u64;
    ((packed >> 32) as u32, packed as u32)
}
