//! Keep-alive store
//!
//! Host objects handed to a script live here until the engine reports that the
//! script side dropped them. Ids are slot positions plus one, reused after removal.

use crate::HostObject;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Slots ever allocated
    pub allocated_slots: usize,
    /// Slots holding an object
    pub used_slots: usize,
    /// Highest `used_slots` seen
    pub peak_used: usize,
}

#[derive(Default)]
struct Slots {
    objects: Vec<Option<Rc<dyn HostObject>>>,
    free: Vec<usize>,
    peak_used: usize,
}

impl Slots {
    fn used(&self) -> usize {
        self.objects.len() - self.free.len()
    }
}

#[derive(Default)]
pub struct KeepAliveStore {
    slots: RefCell<Slots>,
}

impl KeepAliveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `object` alive and return its id
    pub fn add(&self, object: Rc<dyn HostObject>) -> i32 {
        let mut slots = self.slots.borrow_mut();
        let slot = match slots.free.pop() {
            Some(slot) => {
                slots.objects[slot] = Some(object);
                slot
            }
            None => {
                slots.objects.push(Some(object));
                slots.objects.len() - 1
            }
        };
        slots.peak_used = slots.peak_used.max(slots.used());
        slot as i32 + 1
    }

    pub fn get(&self, id: i32) -> Option<Rc<dyn HostObject>> {
        let slot = usize::try_from(id.checked_sub(1)?).ok()?;
        self.slots.borrow().objects.get(slot)?.clone()
    }

    /// Drop the store's reference; false when the id was not in use
    pub fn remove(&self, id: i32) -> bool {
        let Some(slot) = id.checked_sub(1).and_then(|s| usize::try_from(s).ok()) else {
            return false;
        };
        let removed = {
            let mut slots = self.slots.borrow_mut();
            let removed = slots.objects.get_mut(slot).and_then(Option::take);
            if removed.is_some() {
                slots.free.push(slot);
            }
            removed
        };
        // dropped outside the borrow; the object may own other store entries
        removed.is_some()
    }

    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut slots = self.slots.borrow_mut();
            let drained = slots.objects.iter_mut().filter_map(Option::take).collect();
            let len = slots.objects.len();
            slots.free = (0..len).rev().collect();
            drained
        };
        drop(drained);
    }

    pub fn stats(&self) -> StoreStats {
        let slots = self.slots.borrow();
        StoreStats {
            allocated_slots: slots.objects.len(),
            used_slots: slots.used(),
            peak_used: slots.peak_used,
        }
    }
}
