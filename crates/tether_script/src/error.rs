use std::io;
use tether_wire::{ObjectHandle, WireError, WireValue};
use thiserror::Error;

/// Failures inside the engine before they are reported as wire values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has been disposed")]
    Disposed,

    #[error("engine is busy: cannot dispose from inside a call")]
    Busy,

    #[error("every engine id is in use")]
    TooManyEngines,

    #[error("invalid or disposed handle {0}")]
    InvalidHandle(ObjectHandle),

    #[error("property '{name}' is not a function")]
    NotCallable { name: String },

    #[error("cannot marshal a {0} value")]
    Unsupported(&'static str),

    #[error("array element {index}: {source}")]
    ArrayElement {
        index: usize,
        #[source]
        source: Box<EngineError>,
    },

    /// Exception text captured while converting a nested value
    #[error("{0}")]
    Script(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("script runtime: {0}")]
    Runtime(#[from] rquickjs::Error),

    #[error("failed to read script: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Report as an `Error` wire value
    pub fn into_wire(self) -> WireValue {
        WireValue::Error(self.to_string())
    }
}
