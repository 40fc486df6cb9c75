//! Function-pointer host callbacks
//!
//! Arguments passed to a callback are borrowed for the duration of the call. Values a
//! callback returns are owned by the engine and released after decoding.

use tether_script::{HostCallbacks, ScriptEngine, WireValue};
use tether_wire::{OwnedWireValue, RawWireValue};

pub type RemoveFn = unsafe extern "C" fn(id: i32);
pub type GetPropertyFn = unsafe extern "C" fn(id: i32, name: *const u16) -> RawWireValue;
pub type SetPropertyFn = unsafe extern "C" fn(id: i32, name: *const u16, value: RawWireValue) -> RawWireValue;
pub type InvokeFn = unsafe extern "C" fn(id: i32, args: RawWireValue) -> RawWireValue;

/// The four operations a host supplies when creating an engine
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCallbackTable {
    pub remove: Option<RemoveFn>,
    pub get_property: Option<GetPropertyFn>,
    pub set_property: Option<SetPropertyFn>,
    pub invoke: Option<InvokeFn>,
}

pub(crate) struct FfiHost {
    table: HostCallbackTable,
}

impl FfiHost {
    pub fn new(table: HostCallbackTable) -> Self {
        Self { table }
    }
}

pub(crate) fn utf16z(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn missing(slot: &str) -> WireValue {
    WireValue::error(format!("host did not supply a {slot} callback"))
}

/// Decode and release a value the host handed over
fn take_answer(raw: RawWireValue) -> WireValue {
    // SAFETY: callback results are owned by the engine and built with the tether allocators.
    let owned = unsafe { OwnedWireValue::from_raw(raw) };
    owned
        .decode()
        .unwrap_or_else(|err| WireValue::error(format!("invalid host answer: {err}")))
}

impl HostCallbacks for FfiHost {
    fn remove(&self, id: i32) {
        if let Some(remove) = self.table.remove {
            // SAFETY: the host promised a valid callback for the engine's lifetime.
            unsafe { remove(id) }
        }
    }

    fn get_property(&self, _engine: &ScriptEngine, id: i32, name: &str) -> WireValue {
        let Some(get_property) = self.table.get_property else {
            return missing("get_property");
        };
        let name = utf16z(name);
        take_answer(unsafe { get_property(id, name.as_ptr()) })
    }

    fn set_property(&self, _engine: &ScriptEngine, id: i32, name: &str, value: WireValue) -> WireValue {
        let Some(set_property) = self.table.set_property else {
            return missing("set_property");
        };
        let value = match OwnedWireValue::encode(&value) {
            Ok(value) => value,
            Err(err) => return WireValue::error(err.to_string()),
        };
        let name = utf16z(name);
        take_answer(unsafe { set_property(id, name.as_ptr(), value.as_raw()) })
    }

    fn invoke(&self, _engine: &ScriptEngine, id: i32, args: WireValue) -> WireValue {
        let Some(invoke) = self.table.invoke else {
            return missing("invoke");
        };
        let args = match OwnedWireValue::encode(&args) {
            Ok(args) => args,
            Err(err) => return WireValue::error(err.to_string()),
        };
        take_answer(unsafe { invoke(id, args.as_raw()) })
    }
}
