//! Tether C API
//!
//! `extern "C"` surface over [`ScriptEngine`]. Strings are zero-terminated UTF-16.
//! Values passed in are borrowed; values returned are owned by the caller and must be
//! released with [`tether_value_dispose`]. No panic crosses this boundary: a caught
//! panic is reported as an `UnknownError` value.

mod callbacks;

pub use callbacks::{GetPropertyFn, HostCallbackTable, InvokeFn, RemoveFn, SetPropertyFn};

use callbacks::FfiHost;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use tether_script::{EngineConfig, EngineError, ObjectHandle, ObjectMarshal, ScriptEngine, WireValue};
use tether_wire::{RawWireValue, WireType};
use tracing::{error, warn};

/// Opaque engine handle given to C callers
pub struct TetherEngine {
    engine: ScriptEngine,
}

/// Run `f` with panics contained, then encode its result for the caller
fn boundary<F>(op: &'static str, f: F) -> RawWireValue
where
    F: FnOnce() -> WireValue,
{
    let value = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(op, "panic contained at the C boundary");
        WireValue::UnknownError
    });
    RawWireValue::encode(&value).unwrap_or_else(|err| {
        warn!(op, error = %err, "result could not be encoded");
        RawWireValue::unknown_error()
    })
}

unsafe fn engine_op<F>(engine: *const TetherEngine, op: &'static str, f: F) -> RawWireValue
where
    F: FnOnce(&ScriptEngine) -> WireValue,
{
    boundary(op, || match engine.as_ref() {
        Some(engine) => f(&engine.engine),
        None => WireValue::error("null engine"),
    })
}

/// Read a zero-terminated UTF-16 argument
unsafe fn utf16_arg(units: *const u16) -> Result<String, WireValue> {
    if units.is_null() {
        return Err(WireValue::error("null string argument"));
    }
    let mut len = 0;
    while *units.add(len) != 0 {
        len += 1;
    }
    Ok(String::from_utf16_lossy(std::slice::from_raw_parts(units, len)))
}

/// Decode a borrowed value argument
unsafe fn value_arg(value: &RawWireValue) -> Result<WireValue, WireValue> {
    value.decode().map_err(|err| EngineError::from(err).into_wire())
}

/// Create an engine. `marshal_type` is 0 (wrapped) or 1 (dictionary).
///
/// Returns null when the engine cannot be created.
///
/// # Safety
/// Every callback in `callbacks` must stay callable until the engine is disposed.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_new(callbacks: HostCallbackTable, marshal_type: i32) -> *mut TetherEngine {
    let Some(marshal) = ObjectMarshal::from_code(marshal_type) else {
        warn!(marshal_type, "unknown object marshal type");
        return ptr::null_mut();
    };
    let created = panic::catch_unwind(|| {
        let config = EngineConfig::default().with_object_marshal(marshal);
        ScriptEngine::with_config(FfiHost::new(callbacks), config)
    });
    match created {
        Ok(Ok(engine)) => Box::into_raw(Box::new(TetherEngine { engine })),
        Ok(Err(err)) => {
            error!(error = %err, "engine creation failed");
            ptr::null_mut()
        }
        Err(_) => {
            error!("panic contained while creating an engine");
            ptr::null_mut()
        }
    }
}

/// Dispose the engine and free it. Returns 0, or -1 when called from inside a
/// callback (the engine is left running).
///
/// # Safety
/// `engine` must come from [`tether_engine_new`] and not be used after a 0 return.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_dispose(engine: *mut TetherEngine) -> i32 {
    if engine.is_null() {
        return 0;
    }
    let disposed = panic::catch_unwind(AssertUnwindSafe(|| (*engine).engine.dispose()));
    match disposed {
        Ok(Err(EngineError::Busy)) => {
            warn!("engine dispose requested from inside a callback");
            -1
        }
        Ok(_) => {
            drop(Box::from_raw(engine));
            0
        }
        Err(_) => {
            error!("panic contained while disposing an engine");
            -1
        }
    }
}

/// Unpin a handle. A null engine is a no-op. Returns 0, or -1 for an invalid handle.
///
/// # Safety
/// `engine` must be null or a live engine.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_dispose_object(engine: *const TetherEngine, handle: u64) -> i32 {
    let Some(engine) = engine.as_ref() else {
        return 0;
    };
    let handle = ObjectHandle::from_bits(handle);
    match panic::catch_unwind(AssertUnwindSafe(|| engine.engine.dispose_object(handle))) {
        Ok(Ok(())) => 0,
        _ => -1,
    }
}

/// Run the collector and deliver pending removals. Returns 0 on success.
///
/// # Safety
/// `engine` must be null or a live engine.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_force_gc(engine: *const TetherEngine) -> i32 {
    let Some(engine) = engine.as_ref() else {
        return -1;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| engine.engine.collect_garbage())) {
        Ok(Ok(())) => 0,
        _ => -1,
    }
}

/// # Safety
/// `engine` must be null or a live engine; `source` a zero-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_execute(engine: *const TetherEngine, source: *const u16) -> RawWireValue {
    engine_op(engine, "execute", |engine| match utf16_arg(source) {
        Ok(source) => engine.execute(&source),
        Err(err) => err,
    })
}

/// # Safety
/// `engine` must be null or a live engine.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_get_global(engine: *const TetherEngine) -> RawWireValue {
    engine_op(engine, "get_global", |engine| engine.get_global())
}

/// # Safety
/// `engine` must be null or a live engine; `name` a zero-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_get_variable(engine: *const TetherEngine, name: *const u16) -> RawWireValue {
    engine_op(engine, "get_variable", |engine| match utf16_arg(name) {
        Ok(name) => engine.get_variable(&name),
        Err(err) => err,
    })
}

/// # Safety
/// `engine` must be null or a live engine; `name` a zero-terminated UTF-16 string;
/// `value` a valid wire value, borrowed for the call.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_set_variable(
    engine: *const TetherEngine,
    name: *const u16,
    value: RawWireValue,
) -> RawWireValue {
    engine_op(engine, "set_variable", |engine| {
        match (utf16_arg(name), value_arg(&value)) {
            (Ok(name), Ok(value)) => engine.set_variable(&name, &value),
            (Err(err), _) | (_, Err(err)) => err,
        }
    })
}

/// # Safety
/// `engine` must be null or a live engine; `name` a zero-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_get_property_value(
    engine: *const TetherEngine,
    handle: u64,
    name: *const u16,
) -> RawWireValue {
    engine_op(engine, "get_property_value", |engine| match utf16_arg(name) {
        Ok(name) => engine.get_property(ObjectHandle::from_bits(handle), &name),
        Err(err) => err,
    })
}

/// # Safety
/// `engine` must be null or a live engine; `name` a zero-terminated UTF-16 string;
/// `value` a valid wire value, borrowed for the call.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_set_property_value(
    engine: *const TetherEngine,
    handle: u64,
    name: *const u16,
    value: RawWireValue,
) -> RawWireValue {
    engine_op(engine, "set_property_value", |engine| {
        match (utf16_arg(name), value_arg(&value)) {
            (Ok(name), Ok(value)) => engine.set_property(ObjectHandle::from_bits(handle), &name, &value),
            (Err(err), _) | (_, Err(err)) => err,
        }
    })
}

/// # Safety
/// `engine` must be null or a live engine.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_get_property_names(engine: *const TetherEngine, handle: u64) -> RawWireValue {
    engine_op(engine, "get_property_names", |engine| {
        engine.get_property_names(ObjectHandle::from_bits(handle))
    })
}

/// # Safety
/// `engine` must be null or a live engine; `name` a zero-terminated UTF-16 string;
/// `args` a valid wire value, borrowed for the call.
#[no_mangle]
pub unsafe extern "C" fn tether_engine_invoke_property(
    engine: *const TetherEngine,
    handle: u64,
    name: *const u16,
    args: RawWireValue,
) -> RawWireValue {
    engine_op(engine, "invoke_property", |engine| {
        match (utf16_arg(name), value_arg(&args)) {
            (Ok(name), Ok(args)) => engine.invoke_property(ObjectHandle::from_bits(handle), &name, &args),
            (Err(err), _) | (_, Err(err)) => err,
        }
    })
}

/// Copy a zero-terminated UTF-16 string into a new `String` value.
/// A null payload in the result means allocation failed.
///
/// # Safety
/// `units` must be null or zero-terminated.
#[no_mangle]
pub unsafe extern "C" fn tether_value_alloc_string(units: *const u16) -> RawWireValue {
    panic::catch_unwind(|| tether_wire::alloc_string(units))
        .unwrap_or_else(|_| RawWireValue::unallocated(WireType::String))
}

/// Allocate an `Array` value of `len` null slots; negative lengths fail with a null payload.
#[no_mangle]
pub extern "C" fn tether_value_alloc_array(len: i32) -> RawWireValue {
    match usize::try_from(len) {
        Ok(len) => panic::catch_unwind(|| tether_wire::alloc_array(len))
            .unwrap_or_else(|_| RawWireValue::unallocated(WireType::Array)),
        Err(_) => RawWireValue::unallocated(WireType::Array),
    }
}

/// Release a value returned by this library, including every element of an array.
///
/// # Safety
/// `value` must be owned by the caller and released only once.
#[no_mangle]
pub unsafe extern "C" fn tether_value_dispose(value: RawWireValue) {
    if panic::catch_unwind(|| tether_wire::release(value)).is_err() {
        error!(ty = value.ty, "invalid wire value release");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbacks::utf16z;
    use std::cell::RefCell;
    use tether_wire::OwnedWireValue;

    thread_local! {
        static REMOVED: RefCell<Vec<i32>> = const { RefCell::new(Vec::new()) };
        static STORED: RefCell<Vec<(String, WireValue)>> = const { RefCell::new(Vec::new()) };
    }

    fn encode(value: WireValue) -> RawWireValue {
        OwnedWireValue::encode(&value).unwrap().into_raw()
    }

    unsafe extern "C" fn remove(id: i32) {
        REMOVED.with(|r| r.borrow_mut().push(id));
    }

    unsafe extern "C" fn get_property(id: i32, name: *const u16) -> RawWireValue {
        let name = utf16_arg(name).unwrap();
        match (id, name.as_str()) {
            (1, "answer") => encode(WireValue::Integer(42)),
            (1, _) => encode(WireValue::Null),
            _ => encode(WireValue::error(format!("no host object {id}"))),
        }
    }

    unsafe extern "C" fn set_property(_id: i32, name: *const u16, value: RawWireValue) -> RawWireValue {
        let name = utf16_arg(name).unwrap();
        let value = value.decode().unwrap();
        STORED.with(|s| s.borrow_mut().push((name, value)));
        RawWireValue::null()
    }

    unsafe extern "C" fn invoke(_id: i32, args: RawWireValue) -> RawWireValue {
        let args = args.decode().unwrap();
        let count = args.as_array().map_or(0, |a| a.len());
        encode(WireValue::from(format!("called with {count}")))
    }

    fn table() -> HostCallbackTable {
        HostCallbackTable {
            remove: Some(remove),
            get_property: Some(get_property),
            set_property: Some(set_property),
            invoke: Some(invoke),
        }
    }

    fn take(raw: RawWireValue) -> WireValue {
        unsafe { OwnedWireValue::from_raw(raw) }.decode().unwrap()
    }

    struct Engine(*mut TetherEngine);

    impl Engine {
        fn new() -> Self {
            let engine = unsafe { tether_engine_new(table(), 0) };
            assert!(!engine.is_null());
            Self(engine)
        }

        fn execute(&self, source: &str) -> WireValue {
            take(unsafe { tether_engine_execute(self.0, utf16z(source).as_ptr()) })
        }

        fn set(&self, name: &str, value: WireValue) -> WireValue {
            let value = OwnedWireValue::encode(&value).unwrap();
            take(unsafe { tether_engine_set_variable(self.0, utf16z(name).as_ptr(), value.as_raw()) })
        }
    }

    impl Drop for Engine {
        fn drop(&mut self) {
            assert_eq!(unsafe { tether_engine_dispose(self.0) }, 0);
        }
    }

    #[test]
    fn execute_returns_owned_values() {
        let engine = Engine::new();
        assert_eq!(engine.execute("1+1"), WireValue::Integer(2));
        assert_eq!(engine.execute("'x'.repeat(3)"), WireValue::from("xxx"));
        assert_eq!(
            engine.execute("[1, 'two', [null]]"),
            WireValue::Array(vec![1.into(), "two".into(), WireValue::Array(vec![WireValue::Null])])
        );
    }

    #[test]
    fn variables_round_trip_through_the_c_surface() {
        let engine = Engine::new();
        let value = WireValue::Array(vec![WireValue::Number(0.25), WireValue::Boolean(false)]);
        assert_eq!(engine.set("pair", value.clone()), value);
        let back = take(unsafe { tether_engine_get_variable(engine.0, utf16z("pair").as_ptr()) });
        assert_eq!(back, value);
    }

    #[test]
    fn host_strings_keep_lone_surrogates() {
        let engine = Engine::new();
        let lone = tether_wire::alloc_string_units(&[0xDC00, b'z' as u16]);
        let name = utf16z("lone");
        let stored = take(unsafe { tether_engine_set_variable(engine.0, name.as_ptr(), lone) });
        unsafe { tether_value_dispose(lone) };

        assert_eq!(stored.as_string().unwrap().units(), &[0xDC00, b'z' as u16]);
        assert_eq!(engine.execute("lone.charCodeAt(0)"), WireValue::Integer(0xDC00));

        let raw = unsafe { tether_engine_execute(engine.0, utf16z("'\\uD801' + lone").as_ptr()) };
        assert_eq!(raw.length, 3);
        let back = take(raw);
        assert_eq!(back.as_string().unwrap().units(), &[0xD801, 0xDC00, b'z' as u16]);
    }

    #[test]
    fn wrapped_objects_are_reachable_by_handle() {
        let engine = Engine::new();
        let WireValue::WrappedRef(handle) = engine.execute("({ n: 1, twice(x) { return x * 2; } })") else {
            panic!("expected a wrapped object");
        };
        let bits = handle.to_bits();
        let name = utf16z("n");

        let set = OwnedWireValue::encode(&WireValue::Integer(5)).unwrap();
        let stored = take(unsafe { tether_engine_set_property_value(engine.0, bits, name.as_ptr(), set.as_raw()) });
        assert_eq!(stored, WireValue::Integer(5));
        assert_eq!(
            take(unsafe { tether_engine_get_property_value(engine.0, bits, name.as_ptr()) }),
            WireValue::Integer(5)
        );
        assert_eq!(
            take(unsafe { tether_engine_get_property_names(engine.0, bits) }),
            WireValue::Array(vec!["n".into(), "twice".into()])
        );

        let args = OwnedWireValue::encode(&WireValue::Array(vec![21.into()])).unwrap();
        let twice = utf16z("twice");
        assert_eq!(
            take(unsafe { tether_engine_invoke_property(engine.0, bits, twice.as_ptr(), args.as_raw()) }),
            WireValue::Integer(42)
        );

        assert_eq!(unsafe { tether_engine_dispose_object(engine.0, bits) }, 0);
        assert_eq!(unsafe { tether_engine_dispose_object(engine.0, bits) }, -1);
        assert!(take(unsafe { tether_engine_get_property_value(engine.0, bits, name.as_ptr()) }).is_error());
    }

    #[test]
    fn function_pointer_host_is_reached() {
        let engine = Engine::new();
        engine.set("h", WireValue::ManagedRef(1));
        assert_eq!(engine.execute("h.answer"), WireValue::Integer(42));
        assert_eq!(engine.execute("h(1, 2, 3)"), WireValue::from("called with 3"));

        engine.execute("h.label = 'tagged'");
        let stored = STORED.with(|s| s.borrow().last().cloned());
        assert_eq!(stored, Some(("label".to_string(), WireValue::from("tagged"))));
    }

    #[test]
    fn host_errors_and_unknown_ids_surface_as_errors() {
        let engine = Engine::new();
        engine.set("ghost", WireValue::ManagedRef(77));
        let result = engine.execute("ghost.x");
        assert!(result.error_message().unwrap().contains("no host object 77"));
        assert_eq!(engine.execute("2+2"), WireValue::Integer(4));
    }

    #[test]
    fn remove_is_delivered_after_collection() {
        let engine = Engine::new();
        engine.set("h", WireValue::ManagedRef(1));
        engine.execute("h = null");
        assert_eq!(unsafe { tether_engine_force_gc(engine.0) }, 0);
        assert_eq!(REMOVED.with(|r| r.borrow().clone()), vec![1]);
    }

    #[test]
    fn null_engine_is_reported_not_dereferenced() {
        let source = utf16z("1");
        let result = take(unsafe { tether_engine_execute(ptr::null(), source.as_ptr()) });
        assert_eq!(result, WireValue::error("null engine"));
        assert_eq!(unsafe { tether_engine_dispose_object(ptr::null(), 1) }, 0);
        assert_eq!(unsafe { tether_engine_dispose(ptr::null_mut()) }, 0);
    }

    #[test]
    fn null_string_argument_is_an_error() {
        let engine = Engine::new();
        let result = take(unsafe { tether_engine_execute(engine.0, ptr::null()) });
        assert_eq!(result, WireValue::error("null string argument"));
    }

    #[test]
    fn unknown_marshal_type_is_refused() {
        assert!(unsafe { tether_engine_new(table(), 9) }.is_null());
    }

    #[test]
    fn dictionary_marshal_through_the_c_surface() {
        let engine = unsafe { tether_engine_new(table(), 1) };
        let result = take(unsafe { tether_engine_execute(engine, utf16z("({ k: 'v' })").as_ptr()) });
        assert_eq!(result, WireValue::Array(vec![WireValue::Array(vec!["k".into(), "v".into()])]));
        assert_eq!(unsafe { tether_engine_dispose(engine) }, 0);
    }

    #[test]
    fn panics_become_unknown_errors() {
        let raw = boundary("test", || panic!("boom"));
        assert_eq!(raw.ty, WireType::UnknownError.tag());
    }

    #[test]
    fn value_helpers() {
        let text = [b'o' as u16, b'k' as u16, 0, b'!' as u16, 0];
        let raw = unsafe { tether_value_alloc_string(text.as_ptr()) };
        assert_eq!(raw.length, 2);
        assert_eq!(unsafe { raw.decode() }, Ok(WireValue::from("ok")));
        unsafe { tether_value_dispose(raw) };

        let array = tether_value_alloc_array(2);
        assert!(array.is_allocated());
        unsafe { tether_value_dispose(array) };

        assert!(!tether_value_alloc_array(-1).is_allocated());
    }
}
