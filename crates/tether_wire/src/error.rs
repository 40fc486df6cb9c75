use crate::WireType;
use thiserror::Error;

/// Errors raised while moving values through the flat wire layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("could not allocate a buffer of {units} units")]
    Allocation { units: usize },

    #[error("unknown wire type tag {0}")]
    UnknownTag(i32),

    #[error("{ty:?} value has a null payload but length {length}")]
    NullPayload { ty: WireType, length: i32 },

    #[error("{ty:?} value has negative length {length}")]
    NegativeLength { ty: WireType, length: i32 },

    #[error("value of {len} units does not fit the 32-bit length field")]
    TooLong { len: usize },
}
