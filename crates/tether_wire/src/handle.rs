//! Object handle with owner and generation
//!
//! Handles are opaque 64-bit values given to the host for pinned script objects.
//! The generation counter catches use-after-dispose, the owner catches handles
//! presented to an engine that never issued them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a pinned script object.
///
/// Format: [16-bit owner | 16-bit generation | 32-bit index]
/// - Owner: id of the engine instance that issued the handle (never 0)
/// - Generation: bumped every time the slot is disposed
/// - Index: slot position in the issuing engine's handle table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u64", from = "u64")]
pub struct ObjectHandle {
    owner: u16,
    generation: u16,
    index: u32,
}

impl ObjectHandle {
    pub const fn new(owner: u16, generation: u16, index: u32) -> Self {
        Self {
            owner,
            generation,
            index,
        }
    }

    pub fn owner(&self) -> u16 {
        self.owner
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Pack into the 64-bit value carried by the wire payload
    pub fn to_bits(&self) -> u64 {
        ((self.owner as u64) << 48) | ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpack from a wire payload
    pub fn from_bits(bits: u64) -> Self {
        Self {
            owner: (bits >> 48) as u16,
            generation: (bits >> 32) as u16,
            index: bits as u32,
        }
    }
}

impl From<ObjectHandle> for u64 {
    fn from(handle: ObjectHandle) -> Self {
        handle.to_bits()
    }
}

impl From<u64> for ObjectHandle {
    fn from(bits: u64) -> Self {
        ObjectHandle::from_bits(bits)
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}@{}", self.owner, self.index, self.generation)
    }
}
