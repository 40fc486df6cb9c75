//! Host objects exposed to scripts

use crate::{HostError, KeepAliveStore};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tether_script::{ScriptEngine, WireValue};

/// What a host object callback can reach
pub struct HostContext<'a> {
    pub engine: &'a ScriptEngine,
    pub store: &'a KeepAliveStore,
}

impl HostContext<'_> {
    /// Hand another host object to the script
    pub fn wrap(&self, object: Rc<dyn HostObject>) -> WireValue {
        WireValue::ManagedRef(self.store.add(object))
    }
}

/// An object living in the host that scripts can read, write and call
pub trait HostObject {
    fn get_property(&self, _cx: &HostContext<'_>, _name: &str) -> Result<WireValue, HostError> {
        Ok(WireValue::Null)
    }

    fn set_property(&self, _cx: &HostContext<'_>, name: &str, _value: WireValue) -> Result<(), HostError> {
        Err(HostError::ReadOnly(name.to_string()))
    }

    fn invoke(&self, _cx: &HostContext<'_>, _args: Vec<WireValue>) -> Result<WireValue, HostError> {
        Err(HostError::NotCallable)
    }
}

type Callback = dyn Fn(&HostContext<'_>, Vec<WireValue>) -> Result<WireValue, HostError>;

/// Callable host object backed by a closure
pub struct HostFunction {
    name: String,
    callback: Box<Callback>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&HostContext<'_>, Vec<WireValue>) -> Result<WireValue, HostError> + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

impl HostObject for HostFunction {
    fn get_property(&self, _cx: &HostContext<'_>, name: &str) -> Result<WireValue, HostError> {
        Ok(match name {
            "name" => WireValue::from(self.name.as_str()),
            _ => WireValue::Null,
        })
    }

    fn invoke(&self, cx: &HostContext<'_>, args: Vec<WireValue>) -> Result<WireValue, HostError> {
        (self.callback)(cx, args)
    }
}

/// Property bag; missing properties read as `Null`
#[derive(Debug, Default)]
pub struct HostRecord {
    props: RefCell<BTreeMap<String, WireValue>>,
}

impl HostRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, value: impl Into<WireValue>) -> Self {
        self.props.borrow_mut().insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<WireValue> {
        self.props.borrow().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.props.borrow().keys().cloned().collect()
    }
}

impl HostObject for HostRecord {
    fn get_property(&self, _cx: &HostContext<'_>, name: &str) -> Result<WireValue, HostError> {
        Ok(self.get(name).unwrap_or(WireValue::Null))
    }

    fn set_property(&self, _cx: &HostContext<'_>, name: &str, value: WireValue) -> Result<(), HostError> {
        self.props.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }
}
