//! Tagged values

use crate::{ObjectHandle, WireString};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag stored in the flat wire layout.
///
/// The discriminants are part of the ABI and must never change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum WireType {
    UnknownError = -1,
    Null = 0,
    Boolean = 1,
    Integer = 2,
    Number = 3,
    String = 4,
    Date = 5,
    Index = 6,
    Array = 10,
    Error = 11,
    ManagedRef = 12,
    ManagedError = 13,
    WrappedRef = 14,
    WrappedError = 15,
}

impl WireType {
    pub fn from_tag(tag: i32) -> Option<Self> {
        Some(match tag {
            -1 => WireType::UnknownError,
            0 => WireType::Null,
            1 => WireType::Boolean,
            2 => WireType::Integer,
            3 => WireType::Number,
            4 => WireType::String,
            5 => WireType::Date,
            6 => WireType::Index,
            10 => WireType::Array,
            11 => WireType::Error,
            12 => WireType::ManagedRef,
            13 => WireType::ManagedError,
            14 => WireType::WrappedRef,
            15 => WireType::WrappedError,
            _ => return None,
        })
    }

    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Tags whose payload is a heap block released together with the value
    pub fn owns_buffer(self) -> bool {
        matches!(self, WireType::String | WireType::Error | WireType::Array)
    }
}

/// A value crossing the host/script boundary.
///
/// `Index` carries unsigned 32-bit integers that do not fit `Integer`. `String` keeps
/// exact UTF-16 code units; `Error` messages are diagnostic text.
/// `Date` is milliseconds since the Unix epoch. `ManagedRef` ids belong to the host,
/// `WrappedRef` handles belong to the engine that issued them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum WireValue {
    Null,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    String(WireString),
    Date(f64),
    Index(i64),
    Array(Vec<WireValue>),
    Error(String),
    ManagedRef(i32),
    ManagedError(i32),
    WrappedRef(ObjectHandle),
    WrappedError(ObjectHandle),
    UnknownError,
}

impl WireValue {
    pub fn ty(&self) -> WireType {
        match self {
            WireValue::Null => WireType::Null,
            WireValue::Boolean(_) => WireType::Boolean,
            WireValue::Integer(_) => WireType::Integer,
            WireValue::Number(_) => WireType::Number,
            WireValue::String(_) => WireType::String,
            WireValue::Date(_) => WireType::Date,
            WireValue::Index(_) => WireType::Index,
            WireValue::Array(_) => WireType::Array,
            WireValue::Error(_) => WireType::Error,
            WireValue::ManagedRef(_) => WireType::ManagedRef,
            WireValue::ManagedError(_) => WireType::ManagedError,
            WireValue::WrappedRef(_) => WireType::WrappedRef,
            WireValue::WrappedError(_) => WireType::WrappedError,
            WireValue::UnknownError => WireType::UnknownError,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WireValue::Error(message.into())
    }

    /// True for every tag that reports a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            WireValue::Error(_)
                | WireValue::ManagedError(_)
                | WireValue::WrappedError(_)
                | WireValue::UnknownError
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    pub fn as_string(&self) -> Option<&WireString> {
        match self {
            WireValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WireValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Any numeric tag as a double
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireValue::Integer(i) => Some(*i as f64),
            WireValue::Number(n) | WireValue::Date(n) => Some(*n),
            WireValue::Index(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<ObjectHandle> {
        match self {
            WireValue::WrappedRef(h) | WireValue::WrappedError(h) => Some(*h),
            _ => None,
        }
    }

    /// Message of an `Error` value
    pub fn error_message(&self) -> Option<&str> {
        match self {
            WireValue::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        WireValue::Boolean(value)
    }
}

impl From<i32> for WireValue {
    fn from(value: i32) -> Self {
        WireValue::Integer(value)
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        WireValue::Number(value)
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::String(value.into())
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::String(value.into())
    }
}

impl From<WireString> for WireValue {
    fn from(value: WireString) -> Self {
        WireValue::String(value)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(items: Vec<WireValue>) -> Self {
        WireValue::Array(items)
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Null => f.write_str("null"),
            WireValue::Boolean(b) => write!(f, "{b}"),
            WireValue::Integer(i) => write!(f, "{i}"),
            WireValue::Number(n) => write!(f, "{n}"),
            WireValue::String(s) => write!(f, "{:?}", s.to_string_lossy()),
            WireValue::Date(ms) => write!(f, "Date({ms})"),
            WireValue::Index(i) => write!(f, "{i}"),
            WireValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            WireValue::Error(message) => write!(f, "Error({message})"),
            WireValue::ManagedRef(id) => write!(f, "ManagedRef({id})"),
            WireValue::ManagedError(id) => write!(f, "ManagedError({id})"),
            WireValue::WrappedRef(h) => write!(f, "WrappedRef({h})"),
            WireValue::WrappedError(h) => write!(f, "WrappedError({h})"),
            WireValue::UnknownError => f.write_str("UnknownError"),
        }
    }
}
