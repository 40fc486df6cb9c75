//! Host callback interface
//!
//! The only way the engine reaches objects that live in the host. Callbacks run
//! synchronously on the engine's thread and may call back into the same engine.

use crate::ScriptEngine;
use tether_wire::WireValue;

pub trait HostCallbacks {
    /// The script side no longer references `id`.
    ///
    /// Delivered after the current engine call returns, never during collection.
    fn remove(&self, id: i32);

    /// Read `name` from host object `id`; error tags are thrown into the script
    fn get_property(&self, engine: &ScriptEngine, id: i32, name: &str) -> WireValue;

    /// Write `name` on host object `id`; error tags are thrown into the script
    fn set_property(&self, engine: &ScriptEngine, id: i32, name: &str, value: WireValue) -> WireValue;

    /// Call host object `id` with an `Array` of arguments
    fn invoke(&self, engine: &ScriptEngine, id: i32, args: WireValue) -> WireValue;
}

/// Host without objects; every access fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostCallbacks for NullHost {
    fn remove(&self, _id: i32) {}

    fn get_property(&self, _engine: &ScriptEngine, id: i32, _name: &str) -> WireValue {
        WireValue::error(format!("no host object {id}"))
    }

    fn set_property(&self, _engine: &ScriptEngine, id: i32, _name: &str, _value: WireValue) -> WireValue {
        WireValue::error(format!("no host object {id}"))
    }

    fn invoke(&self, _engine: &ScriptEngine, id: i32, _args: WireValue) -> WireValue {
        WireValue::error(format!("no host object {id}"))
    }
}
