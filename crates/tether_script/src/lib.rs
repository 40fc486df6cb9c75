//! Tether Scripting System
//!
//! JavaScript execution via QuickJS with a value bridge to a host runtime.
//!
//! ## Architecture
//!
//! - **Engine:** one runtime and context per [`ScriptEngine`], driven synchronously
//! - **Codec:** script values to and from [`WireValue`]
//! - **Handles:** script objects pinned for the host behind generational [`ObjectHandle`]s
//! - **Proxies:** host objects appear in scripts as callable proxies that forward to
//!   [`HostCallbacks`]

mod codec;
mod config;
mod error;
mod handles;
mod host;
mod proxy;
pub mod runtime;
mod stats;

pub use config::{ConfigError, EngineConfig, ObjectMarshal};
pub use error::EngineError;
pub use handles::HandleTable;
pub use host::{HostCallbacks, NullHost};
pub use runtime::{EngineState, ScriptEngine};
pub use stats::EngineStats;

pub use rquickjs;
pub use tether_wire::{ObjectHandle, WireString, WireType, WireValue};
