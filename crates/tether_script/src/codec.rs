//! Conversion between script values and wire values

use crate::proxy;
use crate::runtime::{Builtins, EngineShared};
use crate::{EngineError, ObjectMarshal};
use rquickjs::convert::Coerced;
use rquickjs::function::This;
use rquickjs::{Array, Ctx, Exception, Object, Persistent, Type, Value};
use tether_wire::{ObjectHandle, WireString, WireValue};
use tracing::warn;

pub(crate) struct ValueCodec<'a, 'js> {
    pub(crate) shared: &'a EngineShared,
    ctx: Ctx<'js>,
    pub(crate) builtins: Builtins<'js>,
}

impl<'a, 'js> ValueCodec<'a, 'js> {
    pub fn new(shared: &'a EngineShared, ctx: Ctx<'js>) -> Result<Self, EngineError> {
        let builtins = shared.builtins(&ctx)?;
        Ok(Self {
            shared,
            ctx,
            builtins,
        })
    }

    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    /// Build the script value for a wire value
    pub fn to_js(&self, value: &WireValue) -> Result<Value<'js>, EngineError> {
        let ctx = self.ctx.clone();
        Ok(match value {
            WireValue::Null => Value::new_null(ctx),
            WireValue::Boolean(b) => Value::new_bool(ctx, *b),
            WireValue::Integer(i) => Value::new_int(ctx, *i),
            WireValue::Number(n) => Value::new_float(ctx, *n),
            WireValue::Index(i) => Value::new_number(ctx, *i as f64),
            WireValue::String(s) => self.text(s)?,
            WireValue::Date(ms) => self.builtins.date.construct((*ms,))?,
            WireValue::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.to_js(item))
                    .collect::<Result<Vec<_>, _>>()?;
                let array = Array::new(ctx)?;
                for (idx, value) in values.into_iter().enumerate() {
                    array.set(idx, value)?;
                }
                array.into_value()
            }
            WireValue::Error(message) => Exception::from_message(ctx, message)?.into_value(),
            WireValue::ManagedRef(id) | WireValue::ManagedError(id) => proxy::create(self, *id)?,
            WireValue::WrappedRef(handle) | WireValue::WrappedError(handle) => {
                self.pinned(*handle)?.into_value()
            }
            WireValue::UnknownError => Exception::from_message(ctx, "unknown error")?.into_value(),
        })
    }

    /// Convert an operation's argument value: `Array` spreads, `Null` is empty
    pub fn arguments(&self, args: &WireValue) -> Result<Vec<Value<'js>>, EngineError> {
        match args {
            WireValue::Null => Ok(Vec::new()),
            WireValue::Array(items) => items.iter().map(|item| self.to_js(item)).collect(),
            single => Ok(vec![self.to_js(single)?]),
        }
    }

    pub fn from_js(&self, value: Value<'js>) -> Result<WireValue, EngineError> {
        self.from_js_at(value, 0)
    }

    fn from_js_at(&self, value: Value<'js>, depth: usize) -> Result<WireValue, EngineError> {
        Ok(match value.type_of() {
            Type::Uninitialized | Type::Undefined | Type::Null => WireValue::Null,
            Type::Bool => WireValue::Boolean(value.get()?),
            Type::Int => WireValue::Integer(value.get()?),
            Type::Float => number(value.get()?),
            Type::String => WireValue::String(self.string(value)?),
            Type::Array if depth < self.shared.config.max_marshal_depth => {
                let array = Array::from_value(value)?;
                let mut items = Vec::with_capacity(array.len());
                for index in 0..array.len() {
                    let item = array
                        .get::<Value>(index)
                        .map_err(EngineError::from)
                        .and_then(|item| self.from_js_at(item, depth + 1))
                        .map_err(|err| EngineError::ArrayElement {
                            index,
                            source: Box::new(self.absorb(err)),
                        })?;
                    items.push(item);
                }
                WireValue::Array(items)
            }
            Type::Function | Type::Constructor => {
                let object = Object::from_value(value)?;
                match self.foreign_id(&object)? {
                    Some(id) => WireValue::ManagedRef(id),
                    None => self.wrap(object),
                }
            }
            Type::Object => {
                let object = Object::from_value(value)?;
                if object.is_instance_of(self.builtins.date.as_value()) {
                    WireValue::Date(self.builtins.get_time.call((This(object),))?)
                } else if self.shared.config.object_marshal == ObjectMarshal::Dictionary
                    && depth < self.shared.config.max_marshal_depth
                {
                    self.dictionary(object, depth)?
                } else {
                    self.wrap(object)
                }
            }
            Type::Array | Type::Exception | Type::Promise => self.wrap(Object::from_value(value)?),
            Type::Symbol => return Err(EngineError::Unsupported("symbol")),
            Type::BigInt => return Err(EngineError::Unsupported("bigint")),
            Type::Module => return Err(EngineError::Unsupported("module")),
            Type::Unknown => return Err(EngineError::Unsupported("unknown")),
        })
    }

    fn string(&self, value: Value<'js>) -> Result<WireString, EngineError> {
        let text = rquickjs::String::from_value(value)?;
        match text.to_string() {
            // U+FFFD may stand in for a lone surrogate, so those go unit by unit
            Ok(text) if !text.contains('\u{FFFD}') => Ok(WireString::from(text)),
            Ok(_) | Err(rquickjs::Error::Utf8(_)) => {
                let units: Vec<i32> = self.builtins.code_units.call((text,))?;
                Ok(WireString::from_units(
                    units.into_iter().map(|unit| unit as u16).collect::<Vec<_>>(),
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn text(&self, text: &WireString) -> Result<Value<'js>, EngineError> {
        match text.to_utf8() {
            Some(text) => Ok(rquickjs::String::from_str(self.ctx.clone(), &text)?.into_value()),
            None => {
                let units: Vec<i32> = text.units().iter().map(|&unit| i32::from(unit)).collect();
                Ok(self.builtins.from_units.call((units,))?)
            }
        }
    }

    // Own enumerable string keys as [name, value] pairs
    fn dictionary(&self, object: Object<'js>, depth: usize) -> Result<WireValue, EngineError> {
        let mut pairs = Vec::new();
        for key in object.keys::<String>() {
            let key = key?;
            let value: Value = object.get(key.as_str())?;
            let value = self.from_js_at(value, depth + 1)?;
            pairs.push(WireValue::Array(vec![WireValue::from(key), value]));
        }
        Ok(WireValue::Array(pairs))
    }

    fn foreign_id(&self, object: &Object<'js>) -> Result<Option<i32>, EngineError> {
        let marks = This(self.builtins.marks.clone());
        Ok(self.builtins.mark_get.call((marks, object.clone()))?)
    }

    pub fn pin(&self, object: Object<'js>) -> ObjectHandle {
        self.shared
            .handles
            .borrow_mut()
            .pin(Persistent::save(&self.ctx, object))
    }

    pub fn wrap(&self, object: Object<'js>) -> WireValue {
        WireValue::WrappedRef(self.pin(object))
    }

    /// Resolve a handle issued by this engine
    pub fn pinned(&self, handle: ObjectHandle) -> Result<Object<'js>, EngineError> {
        let saved = self.shared.handles.borrow().get(handle).cloned();
        match saved {
            Ok(saved) => Ok(saved.restore(&self.ctx)?),
            Err(err) => {
                warn!(engine = self.shared.id, %handle, "invalid handle");
                Err(err)
            }
        }
    }

    /// Take the pending exception and report it as a wire value
    pub fn capture_exception(&self) -> WireValue {
        let thrown = self.ctx.catch();
        self.thrown_into_wire(thrown).unwrap_or_else(|err| {
            warn!(engine = self.shared.id, error = %err, "unreadable exception");
            WireValue::UnknownError
        })
    }

    fn thrown_into_wire(&self, thrown: Value<'js>) -> Result<WireValue, EngineError> {
        match thrown.type_of() {
            Type::Uninitialized | Type::Undefined => Ok(WireValue::UnknownError),
            Type::Function | Type::Constructor => {
                let object = Object::from_value(thrown)?;
                match self.foreign_id(&object)? {
                    Some(id) => Ok(WireValue::ManagedError(id)),
                    None => Ok(WireValue::WrappedError(self.pin(object))),
                }
            }
            Type::Exception => {
                let exception = Exception::from_value(thrown)?;
                Ok(WireValue::Error(describe(&exception)))
            }
            Type::Object | Type::Array | Type::Promise => {
                Ok(WireValue::WrappedError(self.pin(Object::from_value(thrown)?)))
            }
            _ => {
                let text: Coerced<String> = thrown.get()?;
                Ok(WireValue::Error(text.0))
            }
        }
    }

    /// Turn a pending script exception into a plain message, leaving other errors as they are
    fn absorb(&self, err: EngineError) -> EngineError {
        match err {
            EngineError::Runtime(rquickjs::Error::Exception) => match self.capture_exception() {
                WireValue::Error(message) => EngineError::Script(message),
                other => EngineError::Script(format!("exception thrown: {other}")),
            },
            other => other,
        }
    }

    /// Final result of an operation
    pub fn settle(&self, result: Result<WireValue, EngineError>) -> WireValue {
        match result {
            Ok(value) => value,
            Err(EngineError::Runtime(rquickjs::Error::Exception)) => self.capture_exception(),
            Err(err) => {
                // drop anything a half-finished conversion left pending
                let _ = self.ctx.catch();
                err.into_wire()
            }
        }
    }

    /// Error to return from a native callback so the script sees a thrown value
    pub fn throw(&self, err: EngineError) -> rquickjs::Error {
        match err {
            EngineError::Runtime(err) => err,
            other => Exception::throw_message(&self.ctx, &other.to_string()),
        }
    }
}

/// Integral doubles become `Integer` or `Index` when they fit; `-0` stays a double
fn number(n: f64) -> WireValue {
    let integral = n.fract() == 0.0 && !(n == 0.0 && n.is_sign_negative());
    if integral && n >= i32::MIN as f64 && n <= i32::MAX as f64 {
        WireValue::Integer(n as i32)
    } else if integral && n > i32::MAX as f64 && n <= u32::MAX as f64 {
        WireValue::Index(n as i64)
    } else {
        WireValue::Number(n)
    }
}

/// "<name>: <message>" followed by the stack trace when there is one
fn describe(exception: &Exception<'_>) -> String {
    let name = exception
        .get::<_, Option<Coerced<String>>>("name")
        .ok()
        .flatten()
        .map(|name| name.0)
        .unwrap_or_else(|| "Error".to_string());
    let mut text = match exception.message() {
        Some(message) if !message.is_empty() => format!("{name}: {message}"),
        _ => name,
    };
    if let Some(stack) = exception.stack() {
        let stack = stack.trim_end();
        if !stack.is_empty() {
            text.push('\n');
            text.push_str(stack);
        }
    }
    text
}
