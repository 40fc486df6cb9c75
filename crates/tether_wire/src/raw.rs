//! Flat ABI layout
//!
//! `RawWireValue` is blitted across the boundary as-is. Its payload buffers are
//! allocated here and must come back here to be released.

use crate::{ObjectHandle, WireError, WireString, WireType, WireValue};
use bytemuck::Zeroable;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::ptr;
use std::slice;

/// Payload union; the tag selects the valid field.
#[repr(C)]
#[derive(Copy, Clone)]
pub union RawPayload {
    pub i32: i32,
    pub i64: i64,
    pub num: f64,
    pub ptr: *mut c_void,
    pub str: *mut u16,
    pub arr: *mut RawWireValue,
}

// SAFETY: all-zero bytes are valid for every field (0, 0.0 and null).
unsafe impl Zeroable for RawPayload {}

/// 16-byte wire value: 8-byte payload, 4-byte tag, 4-byte length/slot.
///
/// Zeroed bytes decode as `Null`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RawWireValue {
    pub value: RawPayload,
    pub ty: i32,
    pub length: i32,
}

// SAFETY: see RawPayload; a zero tag is `Null`.
unsafe impl Zeroable for RawWireValue {}

const _: () = assert!(mem::size_of::<RawWireValue>() == 16);
const _: () = assert!(mem::offset_of!(RawWireValue, ty) == 8);

#[cfg(debug_assertions)]
mod tracker {
    use once_cell::sync::Lazy;
    use std::collections::HashSet;
    use std::sync::Mutex;

    static LIVE: Lazy<Mutex<HashSet<usize>>> = Lazy::new(Default::default);

    pub fn track(addr: usize) {
        LIVE.lock().unwrap_or_else(|e| e.into_inner()).insert(addr);
    }

    pub fn untrack(addr: usize) {
        let removed = LIVE.lock().unwrap_or_else(|e| e.into_inner()).remove(&addr);
        assert!(
            removed,
            "wire buffer {addr:#x} released twice or not allocated by tether_wire"
        );
    }

    pub fn is_live(addr: usize) -> bool {
        LIVE.lock().unwrap_or_else(|e| e.into_inner()).contains(&addr)
    }
}

#[cfg(debug_assertions)]
use tracker::{track, untrack};

#[cfg(not(debug_assertions))]
#[inline(always)]
fn track(_addr: usize) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
fn untrack(_addr: usize) {}

/// Whether a payload buffer is currently allocated (debug builds only)
#[cfg(debug_assertions)]
pub fn is_live_buffer<T>(ptr: *const T) -> bool {
    tracker::is_live(ptr as usize)
}

fn alloc_units(units: &[u16]) -> Result<*mut u16, WireError> {
    let mut buf: Vec<u16> = Vec::new();
    buf.try_reserve_exact(units.len() + 1)
        .map_err(|_| WireError::Allocation { units: units.len() + 1 })?;
    buf.extend_from_slice(units);
    buf.push(0);
    let str = Box::into_raw(buf.into_boxed_slice()) as *mut u16;
    track(str as usize);
    Ok(str)
}

fn raw_string(ty: WireType, units: &[u16]) -> Result<RawWireValue, WireError> {
    let length = i32::try_from(units.len()).map_err(|_| WireError::TooLong { len: units.len() })?;
    let mut value = RawPayload::zeroed();
    value.str = alloc_units(units)?;
    Ok(RawWireValue {
        value,
        ty: ty.tag(),
        length,
    })
}

// Buffers hold at least one slot so every live array has a distinct address.
fn raw_array(n: usize) -> Result<RawWireValue, WireError> {
    let length = i32::try_from(n).map_err(|_| WireError::TooLong { len: n })?;
    let slots = n.max(1);
    let mut buf: Vec<RawWireValue> = Vec::new();
    buf.try_reserve_exact(slots)
        .map_err(|_| WireError::Allocation { units: slots })?;
    buf.resize(slots, RawWireValue::zeroed());
    let mut value = RawPayload::zeroed();
    value.arr = Box::into_raw(buf.into_boxed_slice()) as *mut RawWireValue;
    track(unsafe { value.arr } as usize);
    Ok(RawWireValue {
        value,
        ty: WireType::Array.tag(),
        length,
    })
}

/// Copy a zero-terminated UTF-16 sequence into a new owned `String` value.
///
/// On allocation failure the payload pointer is null; check [`RawWireValue::is_allocated`].
///
/// # Safety
/// `units` must be null or point to a readable sequence terminated by a zero unit.
pub unsafe fn alloc_string(units: *const u16) -> RawWireValue {
    if units.is_null() {
        return RawWireValue::unallocated(WireType::String);
    }
    let mut len = 0;
    while *units.add(len) != 0 {
        len += 1;
    }
    alloc_string_units(slice::from_raw_parts(units, len))
}

/// Same as [`alloc_string`] for a slice: copying stops at the first zero unit.
pub fn alloc_string_units(units: &[u16]) -> RawWireValue {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    raw_string(WireType::String, &units[..end])
        .unwrap_or_else(|_| RawWireValue::unallocated(WireType::String))
}

/// Allocate an `Array` value with `n` zeroed (`Null`) slots for the caller to fill.
pub fn alloc_array(n: usize) -> RawWireValue {
    raw_array(n).unwrap_or_else(|_| RawWireValue::unallocated(WireType::Array))
}

/// Release the buffers owned by a value: strings and errors free their buffer,
/// arrays release every element and then their buffer, other tags do nothing.
///
/// # Safety
/// Owned payloads must come from this crate and must not have been released before.
/// Debug builds panic on a second release.
pub unsafe fn release(value: RawWireValue) {
    match WireType::from_tag(value.ty) {
        Some(WireType::String | WireType::Error) => {
            let str = value.value.str;
            if !str.is_null() {
                untrack(str as usize);
                let len = value.length.max(0) as usize;
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(str, len + 1)));
            }
        }
        Some(WireType::Array) => {
            let arr = value.value.arr;
            if !arr.is_null() {
                untrack(arr as usize);
                let len = value.length.max(0) as usize;
                let items = Box::from_raw(ptr::slice_from_raw_parts_mut(arr, len.max(1)));
                for item in items.iter().take(len) {
                    release(*item);
                }
            }
        }
        _ => {}
    }
}

impl RawWireValue {
    fn scalar(ty: WireType, value: RawPayload, length: i32) -> Self {
        Self {
            value,
            ty: ty.tag(),
            length,
        }
    }

    /// Owning tag with a null buffer, the allocation failure marker
    pub fn unallocated(ty: WireType) -> Self {
        Self::scalar(ty, RawPayload::zeroed(), 0)
    }

    pub fn null() -> Self {
        Self::zeroed()
    }

    pub fn unknown_error() -> Self {
        Self::scalar(WireType::UnknownError, RawPayload::zeroed(), 0)
    }

    pub fn wire_type(&self) -> Option<WireType> {
        WireType::from_tag(self.ty)
    }

    /// False when an owning tag carries a null buffer (allocation failure)
    pub fn is_allocated(&self) -> bool {
        match self.wire_type() {
            Some(WireType::String | WireType::Error) => !unsafe { self.value.str }.is_null(),
            Some(WireType::Array) => !unsafe { self.value.arr }.is_null(),
            _ => true,
        }
    }

    /// Serialize into the flat layout, allocating owned buffers.
    ///
    /// Buffers allocated before a failure are released again.
    pub fn encode(value: &WireValue) -> Result<RawWireValue, WireError> {
        let mut payload = RawPayload::zeroed();
        Ok(match value {
            WireValue::Null => Self::scalar(WireType::Null, payload, 0),
            WireValue::Boolean(b) => {
                payload.i32 = *b as i32;
                Self::scalar(WireType::Boolean, payload, 0)
            }
            WireValue::Integer(i) => {
                payload.i32 = *i;
                Self::scalar(WireType::Integer, payload, 0)
            }
            WireValue::Number(n) => {
                payload.num = *n;
                Self::scalar(WireType::Number, payload, 0)
            }
            WireValue::Date(ms) => {
                payload.num = *ms;
                Self::scalar(WireType::Date, payload, 0)
            }
            WireValue::Index(i) => {
                payload.i64 = *i;
                Self::scalar(WireType::Index, payload, 0)
            }
            WireValue::String(s) => raw_string(WireType::String, s.units())?,
            WireValue::Error(message) => {
                raw_string(WireType::Error, &message.encode_utf16().collect::<Vec<_>>())?
            }
            WireValue::Array(items) => {
                let raw = raw_array(items.len())?;
                // SAFETY: raw_array allocated at least `items.len()` slots.
                let slots = unsafe { slice::from_raw_parts_mut(raw.value.arr, items.len()) };
                for (slot, item) in slots.iter_mut().zip(items) {
                    match Self::encode(item) {
                        Ok(encoded) => *slot = encoded,
                        Err(err) => {
                            // SAFETY: unfilled slots are still zeroed nulls.
                            unsafe { release(raw) };
                            return Err(err);
                        }
                    }
                }
                raw
            }
            WireValue::ManagedRef(id) => Self::scalar(WireType::ManagedRef, payload, *id),
            WireValue::ManagedError(id) => Self::scalar(WireType::ManagedError, payload, *id),
            WireValue::WrappedRef(handle) => {
                payload.i64 = handle.to_bits() as i64;
                Self::scalar(WireType::WrappedRef, payload, 0)
            }
            WireValue::WrappedError(handle) => {
                payload.i64 = handle.to_bits() as i64;
                Self::scalar(WireType::WrappedError, payload, 0)
            }
            WireValue::UnknownError => Self::scalar(WireType::UnknownError, payload, 0),
        })
    }

    /// Read the value without taking ownership of its buffers.
    ///
    /// `String` units are copied exactly; invalid UTF-16 in an `Error` message is
    /// replaced with U+FFFD.
    ///
    /// # Safety
    /// Payload pointers must be valid for the element count stored in `length`.
    pub unsafe fn decode(&self) -> Result<WireValue, WireError> {
        let ty = self.wire_type().ok_or(WireError::UnknownTag(self.ty))?;
        Ok(match ty {
            WireType::Null => WireValue::Null,
            WireType::Boolean => WireValue::Boolean(self.value.i32 != 0),
            WireType::Integer => WireValue::Integer(self.value.i32),
            WireType::Number => WireValue::Number(self.value.num),
            WireType::Date => WireValue::Date(self.value.num),
            WireType::Index => WireValue::Index(self.value.i64),
            WireType::String => WireValue::String(WireString::from_units(self.units(ty)?)),
            WireType::Error => WireValue::Error(String::from_utf16_lossy(self.units(ty)?)),
            WireType::Array => WireValue::Array(
                self.items()?
                    .iter()
                    .map(|item| item.decode())
                    .collect::<Result<_, _>>()?,
            ),
            WireType::ManagedRef => WireValue::ManagedRef(self.length),
            WireType::ManagedError => WireValue::ManagedError(self.length),
            WireType::WrappedRef => {
                WireValue::WrappedRef(ObjectHandle::from_bits(self.value.i64 as u64))
            }
            WireType::WrappedError => {
                WireValue::WrappedError(ObjectHandle::from_bits(self.value.i64 as u64))
            }
            WireType::UnknownError => WireValue::UnknownError,
        })
    }

    unsafe fn units(&self, ty: WireType) -> Result<&[u16], WireError> {
        let str = self.value.str;
        match (self.length, str.is_null()) {
            (length, _) if length < 0 => Err(WireError::NegativeLength { ty, length }),
            (0, true) => Ok(&[]),
            (length, true) => Err(WireError::NullPayload { ty, length }),
            (length, false) => Ok(slice::from_raw_parts(str, length as usize)),
        }
    }

    unsafe fn items(&self) -> Result<&[RawWireValue], WireError> {
        let arr = self.value.arr;
        match (self.length, arr.is_null()) {
            (length, _) if length < 0 => Err(WireError::NegativeLength {
                ty: WireType::Array,
                length,
            }),
            (0, true) => Ok(&[]),
            (length, true) => Err(WireError::NullPayload {
                ty: WireType::Array,
                length,
            }),
            (length, false) => Ok(slice::from_raw_parts(arr, length as usize)),
        }
    }
}

impl fmt::Debug for RawWireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawWireValue")
            .field("ty", &self.ty)
            .field("length", &self.length)
            .field("payload", &unsafe { self.value.i64 })
            .finish()
    }
}

/// A flat value whose buffers are released when it is dropped.
pub struct OwnedWireValue {
    raw: RawWireValue,
}

impl OwnedWireValue {
    pub fn encode(value: &WireValue) -> Result<Self, WireError> {
        Ok(Self {
            raw: RawWireValue::encode(value)?,
        })
    }

    /// Take ownership of a value received across the boundary.
    ///
    /// # Safety
    /// The caller must own `raw`, and its buffers must come from this crate.
    pub unsafe fn from_raw(raw: RawWireValue) -> Self {
        Self { raw }
    }

    /// Borrowed view for passing into a call that does not take ownership
    pub fn as_raw(&self) -> RawWireValue {
        self.raw
    }

    /// Give up ownership; the receiver must release the value.
    pub fn into_raw(self) -> RawWireValue {
        let raw = self.raw;
        mem::forget(self);
        raw
    }

    pub fn decode(&self) -> Result<WireValue, WireError> {
        // SAFETY: constructed by encode or from an owned raw value.
        unsafe { self.raw.decode() }
    }
}

impl Drop for OwnedWireValue {
    fn drop(&mut self) {
        // SAFETY: this wrapper is the single owner of the buffers.
        unsafe { release(self.raw) }
    }
}
