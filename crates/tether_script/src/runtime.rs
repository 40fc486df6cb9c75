//! Script engine
//!
//! One QuickJS runtime and context per engine. Every operation speaks `WireValue`
//! and reports failures as error values instead of faults.

use crate::codec::ValueCodec;
use crate::proxy::ForeignRefs;
use crate::{EngineConfig, EngineError, EngineStats, HandleTable, HostCallbacks};
use once_cell::sync::Lazy;
use rquickjs::function::{Args, Constructor};
use rquickjs::{
    qjs, Array, Context, Ctx, Function, JsLifetime, Object, Persistent, Runtime, Value,
};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tether_wire::{ObjectHandle, WireValue};
use tracing::{debug, info, warn};

/// Owner ids of engines still alive in this process.
///
/// Ids are handed out round-robin and never while in use, so a handle can only resolve
/// against the engine that issued it. 0 is never issued, so handles are never 0.
#[derive(Debug, Default)]
struct EngineIds {
    live: HashSet<u16>,
    last: u16,
}

impl EngineIds {
    fn acquire(&mut self) -> Option<u16> {
        let mut id = self.last;
        for _ in 0..u16::MAX {
            id = id.wrapping_add(1).max(1);
            if self.live.insert(id) {
                self.last = id;
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, id: u16) {
        self.live.remove(&id);
    }
}

static ENGINE_IDS: Lazy<Mutex<EngineIds>> = Lazy::new(Mutex::default);

fn engine_ids() -> MutexGuard<'static, EngineIds> {
    ENGINE_IDS.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Running,
    Disposed,
}

/// Script values captured at startup so later script code cannot swap them out
#[derive(Clone)]
pub(crate) struct Builtins<'js> {
    /// WeakMap from proxy to host id
    pub marks: Object<'js>,
    pub mark_get: Function<'js>,
    pub mark_set: Function<'js>,
    pub proxy: Constructor<'js>,
    pub date: Constructor<'js>,
    pub get_time: Function<'js>,
    /// String to an array of UTF-16 code units
    pub code_units: Function<'js>,
    /// Array of UTF-16 code units to a string
    pub from_units: Function<'js>,
}

unsafe impl<'js> JsLifetime<'js> for Builtins<'js> {
    type Changed<'to> = Builtins<'to>;
}

// Exact UTF-16 conversions for strings that are not well-formed
const UNIT_HELPERS: &str = r"(() => {
    const apply = Reflect.apply;
    const charCodeAt = String.prototype.charCodeAt;
    const fromCharCode = String.fromCharCode;
    return [
        (s) => {
            const units = new Array(s.length);
            for (let i = 0; i < s.length; i++) units[i] = apply(charCodeAt, s, [i]);
            return units;
        },
        (units) => {
            let s = '';
            for (let i = 0; i < units.length; i += 4096) {
                const chunk = [];
                for (let j = i; j < units.length && j < i + 4096; j++) chunk[j - i] = units[j];
                s += apply(fromCharCode, null, chunk);
            }
            return s;
        },
    ];
})()";

impl<'js> Builtins<'js> {
    fn capture(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let globals = ctx.globals();
        let weak_map: Constructor = globals.get("WeakMap")?;
        let marks: Object = weak_map.construct(())?;
        let date: Constructor = globals.get("Date")?;
        let date_proto: Object = date.get("prototype")?;
        let units: Array = ctx.eval(UNIT_HELPERS)?;
        Ok(Self {
            mark_get: marks.get("get")?,
            mark_set: marks.get("set")?,
            marks,
            proxy: globals.get("Proxy")?,
            get_time: date_proto.get("getTime")?,
            date,
            code_units: units.get(0)?,
            from_units: units.get(1)?,
        })
    }
}

// Field order is drop order
struct LiveRuntime {
    builtins: Persistent<Builtins<'static>>,
    context: Context,
    runtime: Runtime,
}

/// Clears the active context when the outermost call unwinds
struct ActiveCall<'a> {
    slot: &'a Cell<Option<NonNull<qjs::JSContext>>>,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.slot.set(None);
    }
}

pub(crate) struct EngineShared {
    pub(crate) id: u16,
    pub(crate) config: EngineConfig,
    pub(crate) host: Rc<dyn HostCallbacks>,
    pub(crate) this: Weak<EngineShared>,
    state: Cell<EngineState>,
    live: RefCell<Option<LiveRuntime>>,
    pub(crate) handles: RefCell<HandleTable<Persistent<Object<'static>>>>,
    pub(crate) foreign: Rc<RefCell<ForeignRefs>>,
    active: Cell<Option<NonNull<qjs::JSContext>>>,
}

impl EngineShared {
    /// Run `f` with the engine's context.
    ///
    /// Nested calls from host callbacks reuse the context of the call already running.
    /// Pending foreign removals are delivered when the outermost call returns.
    pub(crate) fn with_ctx<R>(&self, f: impl for<'js> FnOnce(Ctx<'js>) -> R) -> Result<R, EngineError> {
        if let Some(raw) = self.active.get() {
            // SAFETY: the outer call on this thread still holds the runtime lock for `raw`
            // and outlives this nested call.
            let ctx = unsafe { Ctx::from_raw(raw) };
            return Ok(f(ctx));
        }

        let result = {
            let live = self.live.borrow();
            let live = live.as_ref().ok_or(EngineError::Disposed)?;
            live.context.with(|ctx| {
                self.active.set(Some(ctx.as_raw()));
                let _call = ActiveCall { slot: &self.active };
                f(ctx)
            })
        };
        self.flush_removals();
        Ok(result)
    }

    pub(crate) fn builtins<'js>(&self, ctx: &Ctx<'js>) -> Result<Builtins<'js>, EngineError> {
        let live = self.live.borrow();
        let live = live.as_ref().ok_or(EngineError::Disposed)?;
        Ok(live.builtins.clone().restore(ctx)?)
    }

    fn in_call(&self) -> bool {
        self.active.get().is_some()
    }

    /// Deliver queued removals to the host, unless a call is still running
    pub(crate) fn flush_removals(&self) {
        if self.in_call() {
            return;
        }
        loop {
            let pending = self.foreign.borrow_mut().take_pending();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                debug!(engine = self.id, id, "foreign reference released");
                self.host.remove(id);
            }
        }
    }

    fn teardown(&self) -> Result<(), EngineError> {
        if self.in_call() {
            return Err(EngineError::Busy);
        }
        if self.state.get() == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        self.state.set(EngineState::Disposed);

        let pinned = self.handles.borrow_mut().clear();
        let pinned_count = pinned.len();
        drop(pinned);

        let live = self.live.borrow_mut().take();
        drop(live);

        self.flush_removals();
        info!(engine = self.id, pinned = pinned_count, "script engine disposed");
        Ok(())
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        if self.state.get() != EngineState::Disposed {
            let _ = self.teardown();
        }
        // held until here so handles of a disposed engine never match a newer one
        engine_ids().release(self.id);
    }
}

/// Isolated script engine bridged to a host runtime
pub struct ScriptEngine {
    shared: Rc<EngineShared>,
}

impl ScriptEngine {
    pub fn new<H: HostCallbacks + 'static>(host: H) -> Result<Self, EngineError> {
        Self::with_config(host, EngineConfig::default())
    }

    pub fn with_config<H: HostCallbacks + 'static>(host: H, config: EngineConfig) -> Result<Self, EngineError> {
        let runtime = Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        let context = Context::full(&runtime)?;
        let builtins = context.with(|ctx| Builtins::capture(&ctx).map(|b| Persistent::save(&ctx, b)))?;

        let id = engine_ids().acquire().ok_or(EngineError::TooManyEngines)?;
        let shared = Rc::new_cyclic(|this| EngineShared {
            id,
            config,
            host: Rc::new(host),
            this: this.clone(),
            state: Cell::new(EngineState::Uninitialized),
            live: RefCell::new(Some(LiveRuntime {
                builtins,
                context,
                runtime,
            })),
            handles: RefCell::new(HandleTable::new(id)),
            foreign: Rc::new(RefCell::new(ForeignRefs::default())),
            active: Cell::new(None),
        });
        shared.state.set(EngineState::Running);

        info!(engine = id, marshal = ?shared.config.object_marshal, "script engine created");
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Rc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Owner id stamped into every handle this engine issues
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == EngineState::Disposed
    }

    /// Release every handle, the context and the runtime, then deliver pending removals.
    ///
    /// Fails with `Busy` from inside a host callback and with `Disposed` the second time.
    pub fn dispose(&self) -> Result<(), EngineError> {
        self.shared.teardown()
    }

    /// Unpin a handle previously returned to the host
    pub fn dispose_object(&self, handle: ObjectHandle) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        let released = self.shared.handles.borrow_mut().dispose(handle);
        match released {
            Ok(object) => {
                drop(object);
                self.shared.flush_removals();
                Ok(())
            }
            Err(err) => {
                warn!(engine = self.shared.id, %handle, "dispose of an invalid handle");
                Err(err)
            }
        }
    }

    /// Run the script collector and deliver the removals it produced
    pub fn collect_garbage(&self) -> Result<(), EngineError> {
        self.shared.with_ctx(|ctx| ctx.run_gc())?;
        debug!(engine = self.shared.id, "garbage collected");
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let heap_bytes = if self.shared.in_call() {
            None
        } else {
            self.shared
                .live
                .borrow()
                .as_ref()
                .map(|live| live.runtime.memory_usage().memory_used_size.max(0) as u64)
        };
        let foreign = self.shared.foreign.borrow();
        EngineStats {
            pinned_handles: self.shared.handles.borrow().len(),
            foreign_ids: foreign.live_ids(),
            live_proxies: foreign.live_proxies(),
            pending_removals: foreign.pending_len(),
            heap_bytes,
        }
    }

    fn run<F>(&self, op: &'static str, f: F) -> WireValue
    where
        F: for<'js> FnOnce(&ValueCodec<'_, 'js>) -> Result<WireValue, EngineError>,
    {
        debug!(engine = self.shared.id, op, "engine call");
        let shared = &*self.shared;
        let result = shared.with_ctx(|ctx| match ValueCodec::new(shared, ctx) {
            Ok(codec) => {
                let result = f(&codec);
                codec.settle(result)
            }
            Err(err) => err.into_wire(),
        });
        result.unwrap_or_else(|err| {
            warn!(engine = shared.id, op, error = %err, "engine call rejected");
            err.into_wire()
        })
    }

    /// Evaluate script source and return its completion value
    pub fn execute(&self, source: &str) -> WireValue {
        self.run("execute", |codec| {
            let value: Value = codec.ctx().eval(source)?;
            codec.from_js(value)
        })
    }

    pub fn execute_file(&self, path: &Path) -> WireValue {
        if self.is_disposed() {
            return EngineError::Disposed.into_wire();
        }
        match std::fs::read_to_string(path) {
            Ok(source) => self.execute(&source),
            Err(err) => {
                warn!(engine = self.shared.id, path = %path.display(), "failed to read script");
                EngineError::Io(err).into_wire()
            }
        }
    }

    /// `WrappedRef` to the global object
    pub fn get_global(&self) -> WireValue {
        self.run("get_global", |codec| Ok(codec.wrap(codec.ctx().globals())))
    }

    /// Read a global binding; missing bindings are `Null`
    pub fn get_variable(&self, name: &str) -> WireValue {
        self.run("get_variable", |codec| {
            let value: Value = codec.ctx().globals().get(name)?;
            codec.from_js(value)
        })
    }

    /// Write a global binding and return the value read back
    pub fn set_variable(&self, name: &str, value: &WireValue) -> WireValue {
        self.run("set_variable", |codec| {
            let globals = codec.ctx().globals();
            globals.set(name, codec.to_js(value)?)?;
            let stored: Value = globals.get(name)?;
            codec.from_js(stored)
        })
    }

    pub fn get_property(&self, handle: ObjectHandle, name: &str) -> WireValue {
        self.run("get_property", |codec| {
            let object = codec.pinned(handle)?;
            let value: Value = object.get(name)?;
            codec.from_js(value)
        })
    }

    /// Write a property and return the value read back
    pub fn set_property(&self, handle: ObjectHandle, name: &str, value: &WireValue) -> WireValue {
        self.run("set_property", |codec| {
            let object = codec.pinned(handle)?;
            object.set(name, codec.to_js(value)?)?;
            let stored: Value = object.get(name)?;
            codec.from_js(stored)
        })
    }

    /// Own enumerable string keys as an `Array` of `String`
    pub fn get_property_names(&self, handle: ObjectHandle) -> WireValue {
        self.run("get_property_names", |codec| {
            let object = codec.pinned(handle)?;
            let names = object
                .keys::<String>()
                .map(|key| key.map(WireValue::from))
                .collect::<rquickjs::Result<Vec<_>>>()?;
            Ok(WireValue::Array(names))
        })
    }

    /// Call method `name` on a pinned object with the object as receiver.
    ///
    /// `args` is an `Array`, `Null` for no arguments, or a single argument.
    pub fn invoke_property(&self, handle: ObjectHandle, name: &str, args: &WireValue) -> WireValue {
        self.run("invoke_property", |codec| {
            let object = codec.pinned(handle)?;
            invoke(codec, object, name, args)
        })
    }

    /// Call a global function
    pub fn call_function(&self, name: &str, args: &WireValue) -> WireValue {
        self.run("call_function", |codec| invoke(codec, codec.ctx().globals(), name, args))
    }
}

fn invoke<'js>(
    codec: &ValueCodec<'_, 'js>,
    receiver: Object<'js>,
    name: &str,
    args: &WireValue,
) -> Result<WireValue, EngineError> {
    let member: Value = receiver.get(name)?;
    let function = member.into_function().ok_or_else(|| EngineError::NotCallable {
        name: name.to_string(),
    })?;
    let values = codec.arguments(args)?;
    let mut call = Args::new(codec.ctx().clone(), values.len());
    call.this(receiver)?;
    for value in values {
        call.push_arg(value)?;
    }
    let result: Value = function.call_arg(call)?;
    codec.from_js(result)
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullHost, ObjectMarshal};
    use std::collections::HashMap;
    use tether_wire::WireString;

    /// Host with plain property bags, recording every removal
    #[derive(Default)]
    struct RecordingHost {
        objects: RefCell<HashMap<i32, HashMap<String, WireValue>>>,
        removed: Rc<RefCell<Vec<i32>>>,
        calls: Rc<RefCell<Vec<(i32, WireValue)>>>,
    }

    impl RecordingHost {
        fn with_object(self, id: i32, props: &[(&str, WireValue)]) -> Self {
            let props = props.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            self.objects.borrow_mut().insert(id, props);
            self
        }
    }

    impl HostCallbacks for RecordingHost {
        fn remove(&self, id: i32) {
            self.removed.borrow_mut().push(id);
        }

        fn get_property(&self, engine: &ScriptEngine, id: i32, name: &str) -> WireValue {
            if name == "peek" {
                return engine.get_variable("secret");
            }
            match self.objects.borrow().get(&id) {
                Some(props) => props.get(name).cloned().unwrap_or(WireValue::Null),
                None => WireValue::error(format!("unknown host object {id}")),
            }
        }

        fn set_property(&self, _engine: &ScriptEngine, id: i32, name: &str, value: WireValue) -> WireValue {
            match self.objects.borrow_mut().get_mut(&id) {
                Some(props) => {
                    props.insert(name.to_string(), value);
                    WireValue::Null
                }
                None => WireValue::error(format!("unknown host object {id}")),
            }
        }

        fn invoke(&self, _engine: &ScriptEngine, id: i32, args: WireValue) -> WireValue {
            self.calls.borrow_mut().push((id, args.clone()));
            match id {
                13 => WireValue::ManagedError(13),
                _ => {
                    let sum = args.as_array().unwrap_or_default().iter().filter_map(WireValue::as_f64).sum::<f64>();
                    WireValue::Number(sum)
                }
            }
        }
    }

    fn engine() -> ScriptEngine {
        ScriptEngine::new(NullHost).unwrap()
    }

    #[test]
    fn one_plus_one_is_an_integer() {
        assert_eq!(engine().execute("1+1"), WireValue::Integer(2));
    }

    #[test]
    fn thrown_error_is_captured() {
        let result = engine().execute("throw new Error('boom')");
        let message = result.error_message().unwrap();
        assert!(message.starts_with("Error: boom"), "{message}");
    }

    #[test]
    fn thrown_primitive_is_coerced() {
        assert_eq!(engine().execute("throw 42"), WireValue::error("42"));
    }

    #[test]
    fn thrown_plain_object_is_pinned() {
        let engine = engine();
        let thrown = engine.execute("throw { code: 7 }");
        let WireValue::WrappedError(handle) = thrown else {
            panic!("unexpected {thrown:?}");
        };
        assert_eq!(engine.get_property(handle, "code"), WireValue::Integer(7));
    }

    #[test]
    fn syntax_errors_are_error_values() {
        let result = engine().execute("let = ;");
        assert!(result.error_message().unwrap().contains("SyntaxError"));
    }

    #[test]
    fn missing_variable_is_null() {
        assert_eq!(engine().get_variable("doesNotExist"), WireValue::Null);
    }

    #[test]
    fn numbers_pick_the_narrowest_tag() {
        let engine = engine();
        assert_eq!(engine.execute("2.0 * 3"), WireValue::Integer(6));
        assert_eq!(engine.execute("4000000000"), WireValue::Index(4_000_000_000));
        assert_eq!(engine.execute("0.5"), WireValue::Number(0.5));
        assert_eq!(engine.execute("2 ** 40"), WireValue::Number(2f64.powi(40)));
        match engine.execute("-0") {
            WireValue::Number(n) => assert!(n == 0.0 && n.is_sign_negative()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn primitives_survive_a_round_trip() {
        let engine = engine();
        for value in [
            WireValue::Null,
            WireValue::Boolean(true),
            WireValue::Integer(-17),
            WireValue::Number(0.1),
            WireValue::from("héllo 😀"),
            WireValue::Date(1_700_000_000_123.0),
        ] {
            assert_eq!(engine.set_variable("v", &value), value);
            assert_eq!(engine.get_variable("v"), value);
        }
    }

    #[test]
    fn nested_arrays_keep_order() {
        let engine = engine();
        let value = WireValue::Array(vec![
            1.into(),
            WireValue::Array(vec!["a".into(), WireValue::Null]),
            true.into(),
        ]);
        engine.set_variable("nested", &value);
        assert_eq!(engine.execute("nested[1][0] + nested.length"), WireValue::from("a3"));
        assert_eq!(engine.get_variable("nested"), value);
    }

    #[test]
    fn error_values_become_script_errors() {
        let engine = engine();
        engine.set_variable("failure", &WireValue::error("disk full"));
        assert_eq!(
            engine.execute("failure instanceof Error && failure.message"),
            WireValue::from("disk full")
        );
    }

    #[test]
    fn dates_cross_as_milliseconds() {
        let engine = engine();
        assert_eq!(engine.execute("new Date(86400000)"), WireValue::Date(86_400_000.0));
    }

    #[test]
    fn lone_surrogates_cross_exactly() {
        let engine = engine();
        let lone = WireValue::String(WireString::from_units(vec![0x61, 0xD800, 0x62]));
        assert_eq!(engine.execute("'a\\uD800b'"), lone);

        assert_eq!(engine.set_variable("s", &lone), lone);
        assert_eq!(
            engine.execute("s.length === 3 && s.charCodeAt(1) === 0xD800"),
            WireValue::Boolean(true)
        );
    }

    #[test]
    fn replacement_characters_are_not_surrogates() {
        let engine = engine();
        assert_eq!(engine.execute("'x\\uFFFD'"), WireValue::from("x\u{FFFD}"));
        engine.set_variable("r", &WireValue::from("\u{FFFD}"));
        assert_eq!(engine.execute("r.charCodeAt(0)"), WireValue::Integer(0xFFFD));
    }

    #[test]
    fn symbols_do_not_marshal() {
        let result = engine().execute("Symbol('s')");
        assert!(result.error_message().unwrap().contains("symbol"));
    }

    #[test]
    fn failing_element_fails_the_whole_array() {
        let result = engine().execute("[1, Symbol('x'), 3]");
        assert_eq!(
            result.error_message(),
            Some("array element 1: cannot marshal a symbol value")
        );
    }

    #[test]
    fn objects_are_wrapped_and_readable() {
        let engine = engine();
        let obj = engine.execute("({ a: 1, b: 'two', sum(x, y) { return this.a + x + y; } })");
        let handle = obj.as_handle().unwrap();
        assert_eq!(handle.owner(), engine.id());

        assert_eq!(engine.get_property(handle, "b"), WireValue::from("two"));
        assert_eq!(
            engine.get_property_names(handle),
            WireValue::Array(vec!["a".into(), "b".into(), "sum".into()])
        );
        assert_eq!(
            engine.invoke_property(handle, "sum", &WireValue::Array(vec![2.into(), 3.into()])),
            WireValue::Integer(6)
        );
        assert_eq!(engine.set_property(handle, "a", &10.into()), WireValue::Integer(10));
        assert_eq!(engine.invoke_property(handle, "sum", &WireValue::Array(vec![0.into(), 0.into()])), WireValue::Integer(10));
    }

    #[test]
    fn single_argument_and_null_arguments() {
        let engine = engine();
        engine.execute("function count() { return arguments.length; }");
        assert_eq!(engine.call_function("count", &WireValue::Null), WireValue::Integer(0));
        assert_eq!(engine.call_function("count", &"x".into()), WireValue::Integer(1));
    }

    #[test]
    fn missing_method_is_an_error_value() {
        let engine = engine();
        let handle = engine.execute("({})").as_handle().unwrap();
        let result = engine.invoke_property(handle, "missingMethod", &WireValue::Array(vec![]));
        assert_eq!(
            result,
            WireValue::error("property 'missingMethod' is not a function")
        );
        assert_eq!(engine.execute("1"), WireValue::Integer(1));
    }

    #[test]
    fn global_object_is_wrapped() {
        let engine = engine();
        engine.execute("var answer = 42;");
        let global = engine.get_global().as_handle().unwrap();
        assert_eq!(engine.get_property(global, "answer"), WireValue::Integer(42));
    }

    #[test]
    fn stale_handle_after_dispose_object() {
        let engine = engine();
        let handle = engine.execute("({ x: 1 })").as_handle().unwrap();
        engine.dispose_object(handle).unwrap();

        let result = engine.get_property(handle, "x");
        assert!(result.error_message().unwrap().contains("invalid or disposed handle"));
        assert!(matches!(
            engine.dispose_object(handle),
            Err(EngineError::InvalidHandle(h)) if h == handle
        ));
        assert_eq!(engine.stats().pinned_handles, 0);
    }

    #[test]
    fn handles_from_another_engine_are_rejected() {
        let a = engine();
        let b = engine();
        let handle = a.execute("({ x: 1 })").as_handle().unwrap();
        b.execute("({ y: 2 })");
        assert!(b.get_property(handle, "x").is_error());
        assert_eq!(a.get_property(handle, "x"), WireValue::Integer(1));
    }

    #[test]
    fn operations_after_dispose_fail() {
        let engine = engine();
        engine.dispose().unwrap();
        assert!(engine.is_disposed());
        assert_eq!(engine.execute("1"), WireValue::error("engine has been disposed"));
        assert_eq!(engine.get_variable("x"), WireValue::error("engine has been disposed"));
        assert!(matches!(engine.dispose(), Err(EngineError::Disposed)));
        assert!(matches!(engine.collect_garbage(), Err(EngineError::Disposed)));
    }

    #[test]
    fn dictionary_marshal_copies_plain_objects() {
        let config = EngineConfig::default().with_object_marshal(ObjectMarshal::Dictionary);
        let engine = ScriptEngine::with_config(NullHost, config).unwrap();
        assert_eq!(
            engine.execute("({ a: 1, inner: { b: [true] } })"),
            WireValue::Array(vec![
                WireValue::Array(vec!["a".into(), 1.into()]),
                WireValue::Array(vec![
                    "inner".into(),
                    WireValue::Array(vec![WireValue::Array(vec![
                        "b".into(),
                        WireValue::Array(vec![true.into()]),
                    ])]),
                ]),
            ])
        );
        assert!(matches!(engine.execute("(function () {})"), WireValue::WrappedRef(_)));
    }

    #[test]
    fn dictionary_marshal_stops_at_the_depth_limit() {
        let config = EngineConfig {
            object_marshal: ObjectMarshal::Dictionary,
            max_marshal_depth: 1,
            ..EngineConfig::default()
        };
        let engine = ScriptEngine::with_config(NullHost, config).unwrap();
        let result = engine.execute("const o = { self: null }; o.self = o; o");
        let WireValue::Array(pairs) = result else {
            panic!("unexpected {result:?}");
        };
        assert_eq!(pairs[0].as_array().unwrap()[0], WireValue::from("self"));
        assert!(matches!(pairs[0].as_array().unwrap()[1], WireValue::WrappedRef(_)));
    }

    #[test]
    fn host_objects_answer_property_reads() {
        let host = RecordingHost::default().with_object(5, &[("name", "widget".into())]);
        let engine = ScriptEngine::new(host).unwrap();
        engine.set_variable("w", &WireValue::ManagedRef(5));
        assert_eq!(engine.execute("w.name"), WireValue::from("widget"));
        assert_eq!(engine.execute("w.missing"), WireValue::Null);
        assert_eq!(engine.get_variable("w"), WireValue::ManagedRef(5));
    }

    #[test]
    fn host_objects_accept_writes_and_calls() {
        let host = RecordingHost::default().with_object(5, &[]);
        let engine = ScriptEngine::new(host).unwrap();
        engine.set_variable("w", &WireValue::ManagedRef(5));
        assert_eq!(engine.execute("w.size = 3; w.size"), WireValue::Integer(3));
        assert_eq!(engine.execute("w(1, 2, 3.5)"), WireValue::Number(6.5));
    }

    #[test]
    fn unknown_host_id_throws_and_engine_survives() {
        let engine = ScriptEngine::new(RecordingHost::default()).unwrap();
        engine.set_variable("ghost", &WireValue::ManagedRef(99));
        let result = engine.execute("ghost.anything");
        assert!(result.error_message().unwrap().contains("unknown host object 99"));
        assert_eq!(engine.execute("1+1"), WireValue::Integer(2));
    }

    #[test]
    fn host_can_throw_its_own_object() {
        let engine = ScriptEngine::new(RecordingHost::default()).unwrap();
        engine.set_variable("fail", &WireValue::ManagedRef(13));
        assert_eq!(engine.execute("fail()"), WireValue::ManagedError(13));
        assert_eq!(
            engine.execute("try { fail() } catch (e) { e }"),
            WireValue::ManagedRef(13)
        );
    }

    #[test]
    fn host_callbacks_can_reenter_the_engine() {
        let host = RecordingHost::default().with_object(1, &[]);
        let engine = ScriptEngine::new(host).unwrap();
        engine.execute("var secret = 'hidden';");
        engine.set_variable("h", &WireValue::ManagedRef(1));
        assert_eq!(engine.execute("h.peek"), WireValue::from("hidden"));
    }

    #[test]
    fn dispose_inside_a_callback_is_busy() {
        struct Disposer;
        impl HostCallbacks for Disposer {
            fn remove(&self, _id: i32) {}
            fn get_property(&self, engine: &ScriptEngine, _id: i32, _name: &str) -> WireValue {
                match engine.dispose() {
                    Err(EngineError::Busy) => "busy".into(),
                    other => WireValue::error(format!("{other:?}")),
                }
            }
            fn set_property(&self, _: &ScriptEngine, _: i32, _: &str, _: WireValue) -> WireValue {
                WireValue::Null
            }
            fn invoke(&self, _: &ScriptEngine, _: i32, _: WireValue) -> WireValue {
                WireValue::Null
            }
        }

        let engine = ScriptEngine::new(Disposer).unwrap();
        engine.set_variable("d", &WireValue::ManagedRef(1));
        assert_eq!(engine.execute("d.x"), WireValue::from("busy"));
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn remove_fires_once_after_the_last_proxy_is_collected() {
        let host = RecordingHost::default().with_object(7, &[]);
        let removed = host.removed.clone();
        let engine = ScriptEngine::new(host).unwrap();

        engine.set_variable("a", &WireValue::ManagedRef(7));
        engine.set_variable("b", &WireValue::ManagedRef(7));
        assert_eq!(engine.stats().live_proxies, 2);

        engine.execute("a = null;");
        engine.collect_garbage().unwrap();
        assert!(removed.borrow().is_empty());

        engine.execute("b = null;");
        engine.collect_garbage().unwrap();
        assert_eq!(*removed.borrow(), vec![7]);
        assert_eq!(engine.stats().foreign_ids, 0);

        engine.collect_garbage().unwrap();
        assert_eq!(*removed.borrow(), vec![7]);
    }

    #[test]
    fn dispose_releases_remaining_foreign_ids() {
        let host = RecordingHost::default().with_object(3, &[]).with_object(4, &[]);
        let removed = host.removed.clone();
        let engine = ScriptEngine::new(host).unwrap();
        engine.set_variable("x", &WireValue::ManagedRef(3));
        engine.set_variable("y", &WireValue::Array(vec![WireValue::ManagedRef(4)]));

        engine.dispose().unwrap();
        let mut ids = removed.borrow().clone();
        ids.sort();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn proxies_passed_back_keep_their_id() {
        let host = RecordingHost::default().with_object(8, &[]);
        let engine = ScriptEngine::new(host).unwrap();
        engine.set_variable("p", &WireValue::ManagedRef(8));
        assert_eq!(
            engine.execute("[p, typeof p]"),
            WireValue::Array(vec![WireValue::ManagedRef(8), "function".into()])
        );
    }

    #[test]
    fn call_arguments_reach_the_host_as_an_array() {
        let host = RecordingHost::default().with_object(2, &[]);
        let calls = host.calls.clone();
        let engine = ScriptEngine::new(host).unwrap();
        engine.set_variable("f", &WireValue::ManagedRef(2));
        engine.execute("f('a', [1])");
        assert_eq!(
            *calls.borrow(),
            vec![(2, WireValue::Array(vec!["a".into(), WireValue::Array(vec![1.into()])]))]
        );
        assert_eq!(
            engine.stats().pinned_handles,
            0,
            "array arguments are copied, not pinned"
        );
    }

    #[test]
    fn stats_report_heap_usage_between_calls() {
        let engine = engine();
        engine.execute("var big = new Array(1000).fill('x');");
        let stats = engine.stats();
        assert!(stats.heap_bytes.unwrap() > 0);
        assert_eq!(stats.pending_removals, 0);
    }

    #[test]
    fn execute_file_reports_io_errors() {
        let result = engine().execute_file(Path::new("/nonexistent/script.js"));
        assert!(result.error_message().unwrap().starts_with("failed to read script"));
    }

    #[test]
    fn engines_run_on_parallel_threads() {
        use rayon::prelude::*;

        let results: Vec<WireValue> = (0..8)
            .into_par_iter()
            .map(|i| {
                let engine = ScriptEngine::new(NullHost).unwrap();
                engine.set_variable("n", &WireValue::Integer(i));
                engine.execute("let acc = 0; for (let k = 0; k <= n; k++) acc += k; acc")
            })
            .collect();
        let expected: Vec<WireValue> = (0..8).map(|n| WireValue::Integer(n * (n + 1) / 2)).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn engines_have_distinct_ids() {
        assert_ne!(engine().id(), engine().id());
    }

    #[test]
    fn engine_ids_skip_live_ids_after_wrapping() {
        let mut ids = EngineIds {
            last: u16::MAX - 1,
            ..EngineIds::default()
        };
        ids.live.extend([u16::MAX, 1]);
        assert_eq!(ids.acquire(), Some(2));
        assert_eq!(ids.acquire(), Some(3));
    }

    #[test]
    fn engine_ids_run_out_only_when_all_are_live() {
        let mut ids = EngineIds::default();
        for _ in 0..u16::MAX {
            assert!(ids.acquire().is_some());
        }
        assert!(!ids.live.contains(&0));
        assert_eq!(ids.acquire(), None);

        ids.release(40);
        assert_eq!(ids.acquire(), Some(40));
    }

    #[test]
    fn dropped_engines_return_their_id() {
        let engine = engine();
        let id = engine.id();
        engine.dispose().unwrap();
        assert!(engine_ids().live.contains(&id));
        drop(engine);
        assert!(!engine_ids().live.contains(&id));
    }

    #[test]
    fn wrapped_counter_never_reuses_a_live_owner() {
        let a = engine();
        let handle = a.execute("({ secret: 'from-a' })").as_handle().unwrap();

        // point the counter just before `a`, as after a full wrap
        engine_ids().last = a.id().wrapping_sub(1);
        let b = engine();
        b.execute("({ secret: 'from-b' })");

        assert_ne!(b.id(), a.id());
        assert!(b.get_property(handle, "secret").is_error());
        assert_eq!(a.get_property(handle, "secret"), WireValue::from("from-a"));
    }
}
