//! Tether Reference Host
//!
//! Host-side half of the bridge: host objects are kept alive in a
//! [`KeepAliveStore`] while scripts hold proxies to them, and [`HostBridge`]
//! answers the engine's callbacks from that store.

mod bridge;
mod error;
mod object;
mod store;

pub use bridge::HostBridge;
pub use error::HostError;
pub use object::{HostContext, HostFunction, HostObject, HostRecord};
pub use store::{KeepAliveStore, StoreStats};
