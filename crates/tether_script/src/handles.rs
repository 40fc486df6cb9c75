//! Pinned objects handed out to the host
//!
//! Slots are reused through a free list. Disposing a slot bumps its generation so
//! earlier handles to the same index stop resolving.

use crate::EngineError;
use tether_wire::ObjectHandle;

pub struct HandleTable<T> {
    owner: u16,
    generations: Vec<u16>,
    values: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    pub fn new(owner: u16) -> Self {
        Self {
            owner,
            generations: Vec::new(),
            values: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn pin(&mut self, value: T) -> ObjectHandle {
        let index = match self.free.pop() {
            Some(index) => {
                self.values[index as usize] = Some(value);
                index
            }
            None => {
                self.generations.push(0);
                self.values.push(Some(value));
                (self.values.len() - 1) as u32
            }
        };
        ObjectHandle::new(self.owner, self.generations[index as usize], index)
    }

    fn slot(&self, handle: ObjectHandle) -> Option<usize> {
        let idx = handle.index() as usize;
        let live = handle.owner() == self.owner
            && idx < self.values.len()
            && self.generations[idx] == handle.generation()
            && self.values[idx].is_some();
        live.then_some(idx)
    }

    pub fn get(&self, handle: ObjectHandle) -> Result<&T, EngineError> {
        self.slot(handle)
            .and_then(|idx| self.values[idx].as_ref())
            .ok_or(EngineError::InvalidHandle(handle))
    }

    /// Unpin and return the value so the caller decides where it is dropped
    pub fn dispose(&mut self, handle: ObjectHandle) -> Result<T, EngineError> {
        let idx = self.slot(handle).ok_or(EngineError::InvalidHandle(handle))?;
        let value = self.values[idx].take().ok_or(EngineError::InvalidHandle(handle))?;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free.push(idx as u32);
        Ok(value)
    }

    /// Unpin everything; every outstanding handle becomes stale
    pub fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        for (idx, value) in self.values.iter_mut().enumerate() {
            if let Some(value) = value.take() {
                self.generations[idx] = self.generations[idx].wrapping_add(1);
                self.free.push(idx as u32);
                drained.push(value);
            }
        }
        drained
    }

    /// Number of pinned values
    pub fn len(&self) -> usize {
        self.values.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
