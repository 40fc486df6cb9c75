//! Script-side stand-ins for host objects
//!
//! A proxy is a script `Proxy` over a callable target. Its traps forward property
//! reads, writes and calls to the host. All three traps share one `ForeignRef`;
//! when the collector reclaims the proxy the traps are freed, the token drops and
//! the id is queued for `HostCallbacks::remove` once its last proxy is gone.

use crate::codec::ValueCodec;
use crate::runtime::EngineShared;
use crate::{EngineError, ScriptEngine};
use rquickjs::convert::Coerced;
use rquickjs::function::This;
use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tether_wire::WireValue;
use tracing::trace;

/// Live proxy count per host id plus ids waiting for `remove`
#[derive(Debug, Default)]
pub(crate) struct ForeignRefs {
    counts: HashMap<i32, u32>,
    pending: Vec<i32>,
}

impl ForeignRefs {
    fn retain(&mut self, id: i32) {
        // re-referenced before delivery: the earlier release is void
        if let Some(pos) = self.pending.iter().position(|&p| p == id) {
            self.pending.swap_remove(pos);
        }
        *self.counts.entry(id).or_insert(0) += 1;
    }

    fn release(&mut self, id: i32) {
        if let Some(count) = self.counts.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&id);
                self.pending.push(id);
            }
        }
    }

    pub fn take_pending(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.pending)
    }

    pub fn live_ids(&self) -> usize {
        self.counts.len()
    }

    pub fn live_proxies(&self) -> usize {
        self.counts.values().map(|&c| c as usize).sum()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Ownership token shared by the traps of one proxy
pub(crate) struct ForeignRef {
    id: i32,
    refs: Rc<RefCell<ForeignRefs>>,
}

impl ForeignRef {
    fn new(id: i32, refs: Rc<RefCell<ForeignRefs>>) -> Self {
        refs.borrow_mut().retain(id);
        Self { id, refs }
    }
}

impl Drop for ForeignRef {
    fn drop(&mut self) {
        self.refs.borrow_mut().release(self.id);
    }
}

/// Create a proxy for host object `id` and register it for recognition
pub(crate) fn create<'js>(codec: &ValueCodec<'_, 'js>, id: i32) -> Result<Value<'js>, EngineError> {
    let ctx = codec.ctx().clone();
    let shared = codec.shared;
    let token = Rc::new(ForeignRef::new(id, shared.foreign.clone()));

    let handler = Object::new(ctx.clone())?;
    let (engine, foreign) = (shared.this.clone(), token.clone());
    handler.set(
        "get",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, _target: Value<'js>, key: Value<'js>| -> rquickjs::Result<Value<'js>> {
                trap_get(&ctx, &engine, &foreign, key)
            },
        )?,
    )?;
    let (engine, foreign) = (shared.this.clone(), token.clone());
    handler.set(
        "set",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, _target: Value<'js>, key: Value<'js>, value: Value<'js>| -> rquickjs::Result<bool> {
                trap_set(&ctx, &engine, &foreign, key, value)
            },
        )?,
    )?;
    let (engine, foreign) = (shared.this.clone(), token);
    handler.set(
        "apply",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, _target: Value<'js>, _this: Value<'js>, args: Array<'js>| -> rquickjs::Result<Value<'js>> {
                trap_apply(&ctx, &engine, &foreign, args)
            },
        )?,
    )?;

    let target = Function::new(ctx.clone(), || ())?;
    let proxy: Object = codec.builtins.proxy.construct((target, handler))?;
    let marks = This(codec.builtins.marks.clone());
    codec.builtins.mark_set.call::<_, Value>((marks, proxy.clone(), id))?;
    trace!(engine = shared.id, id, "proxy created");
    Ok(proxy.into_value())
}

fn upgrade(ctx: &Ctx<'_>, engine: &Weak<EngineShared>) -> rquickjs::Result<Rc<EngineShared>> {
    engine
        .upgrade()
        .ok_or_else(|| Exception::throw_message(ctx, "engine has been disposed"))
}

fn property_name(key: &Value<'_>) -> rquickjs::Result<String> {
    let name: Coerced<String> = key.get()?;
    Ok(name.0)
}

/// Convert a host answer; error tags are thrown
fn deliver<'js>(codec: &ValueCodec<'_, 'js>, answer: WireValue) -> rquickjs::Result<Value<'js>> {
    let thrown = answer.is_error();
    let value = codec.to_js(&answer).map_err(|err| codec.throw(err))?;
    if thrown {
        Err(codec.ctx().throw(value))
    } else {
        Ok(value)
    }
}

fn trap_get<'js>(
    ctx: &Ctx<'js>,
    engine: &Weak<EngineShared>,
    foreign: &ForeignRef,
    key: Value<'js>,
) -> rquickjs::Result<Value<'js>> {
    if key.is_symbol() {
        return Ok(Value::new_undefined(ctx.clone()));
    }
    let name = property_name(&key)?;
    let shared = upgrade(ctx, engine)?;
    trace!(engine = shared.id, id = foreign.id, %name, "proxy get");

    let answer = shared
        .host
        .get_property(&ScriptEngine::from_shared(shared.clone()), foreign.id, &name);
    let codec = ValueCodec::new(&shared, ctx.clone())
        .map_err(|err| Exception::throw_message(ctx, &err.to_string()))?;
    deliver(&codec, answer)
}

fn trap_set<'js>(
    ctx: &Ctx<'js>,
    engine: &Weak<EngineShared>,
    foreign: &ForeignRef,
    key: Value<'js>,
    value: Value<'js>,
) -> rquickjs::Result<bool> {
    if key.is_symbol() {
        return Ok(true);
    }
    let name = property_name(&key)?;
    let shared = upgrade(ctx, engine)?;
    trace!(engine = shared.id, id = foreign.id, %name, "proxy set");

    let codec = ValueCodec::new(&shared, ctx.clone())
        .map_err(|err| Exception::throw_message(ctx, &err.to_string()))?;
    let value = codec.from_js(value).map_err(|err| codec.throw(err))?;
    let answer = shared.host.set_property(
        &ScriptEngine::from_shared(shared.clone()),
        foreign.id,
        &name,
        value,
    );
    if answer.is_error() {
        deliver(&codec, answer)?;
    }
    Ok(true)
}

fn trap_apply<'js>(
    ctx: &Ctx<'js>,
    engine: &Weak<EngineShared>,
    foreign: &ForeignRef,
    args: Array<'js>,
) -> rquickjs::Result<Value<'js>> {
    let shared = upgrade(ctx, engine)?;
    trace!(engine = shared.id, id = foreign.id, argc = args.len(), "proxy call");

    let codec = ValueCodec::new(&shared, ctx.clone())
        .map_err(|err| Exception::throw_message(ctx, &err.to_string()))?;
    let args = codec.from_js(args.into_value()).map_err(|err| codec.throw(err))?;
    let answer = shared
        .host
        .invoke(&ScriptEngine::from_shared(shared.clone()), foreign.id, args);
    deliver(&codec, answer)
}
