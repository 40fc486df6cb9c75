//! Tether Wire Format
//!
//! Values exchanged between the host runtime and the script engine.
//!
//! ## Layers
//!
//! - **[`WireValue`]:** closed enum used everywhere inside Rust
//! - **[`RawWireValue`]:** flat 16-byte `#[repr(C)]` struct, only at the ABI boundary
//! - **[`OwnedWireValue`]:** owning wrapper that releases its buffers exactly once
//! - **[`WireString`]:** string payload kept as UTF-16 code units
//!
//! Inputs crossing the boundary are borrowed for the duration of a call; results are
//! owned by whoever receives them.

mod error;
mod handle;
mod raw;
mod text;
mod value;

pub use error::WireError;
pub use handle::ObjectHandle;
pub use raw::{alloc_array, alloc_string, alloc_string_units, release, OwnedWireValue, RawPayload, RawWireValue};
pub use text::WireString;
pub use value::{WireType, WireValue};

#[cfg(debug_assertions)]
pub use raw::is_live_buffer;

/// Wire format version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
