use tether_script::WireValue;
use thiserror::Error;

/// Failures raised by host objects; reported to scripts as thrown errors
#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid keep-alive slot: {0}")]
    InvalidSlot(i32),

    #[error("property '{0}' is read-only")]
    ReadOnly(String),

    #[error("host object is not callable")]
    NotCallable,

    #[error("{0}")]
    Message(String),

    /// Throw a specific value, e.g. a `ManagedError` for a host exception object
    #[error("host object threw {0}")]
    Throw(WireValue),
}

impl HostError {
    pub fn msg(message: impl Into<String>) -> Self {
        HostError::Message(message.into())
    }

    pub fn into_wire(self) -> WireValue {
        match self {
            HostError::Throw(value) if value.is_error() => value,
            other => WireValue::Error(other.to_string()),
        }
    }
}
