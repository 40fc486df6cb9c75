//! Engine callbacks resolved against the keep-alive store

use crate::{HostContext, HostError, HostObject, KeepAliveStore};
use std::rc::Rc;
use tether_script::{HostCallbacks, ScriptEngine, WireValue};
use tracing::{debug, warn};

pub struct HostBridge {
    store: Rc<KeepAliveStore>,
}

impl HostBridge {
    pub fn new(store: Rc<KeepAliveStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Rc<KeepAliveStore> {
        &self.store
    }

    fn dispatch<F>(&self, engine: &ScriptEngine, id: i32, f: F) -> WireValue
    where
        F: FnOnce(&dyn HostObject, &HostContext<'_>) -> Result<WireValue, HostError>,
    {
        let Some(object) = self.store.get(id) else {
            warn!(id, "script touched an unknown host object");
            return HostError::InvalidSlot(id).into_wire();
        };
        let cx = HostContext {
            engine,
            store: &self.store,
        };
        f(object.as_ref(), &cx).unwrap_or_else(HostError::into_wire)
    }
}

impl HostCallbacks for HostBridge {
    fn remove(&self, id: i32) {
        if self.store.remove(id) {
            debug!(id, "host object released by script");
        } else {
            warn!(id, "release of an unknown host object");
        }
    }

    fn get_property(&self, engine: &ScriptEngine, id: i32, name: &str) -> WireValue {
        self.dispatch(engine, id, |object, cx| object.get_property(cx, name))
    }

    fn set_property(&self, engine: &ScriptEngine, id: i32, name: &str, value: WireValue) -> WireValue {
        self.dispatch(engine, id, |object, cx| {
            object.set_property(cx, name, value).map(|()| WireValue::Null)
        })
    }

    fn invoke(&self, engine: &ScriptEngine, id: i32, args: WireValue) -> WireValue {
        let args = match args {
            WireValue::Array(items) => items,
            WireValue::Null => Vec::new(),
            single => vec![single],
        };
        self.dispatch(engine, id, |object, cx| object.invoke(cx, args))
    }
}
