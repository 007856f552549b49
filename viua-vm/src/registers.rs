//! Register sets: fixed-capacity vectors of value slots with per-slot flags.
//!
//! Every access is bounds-checked against the set's capacity; violations
//! surface as `Out_of_bounds` exception values. Each slot may carry a pointer
//! liveness token: the token stays true while the slot holds a value and is
//! flipped off when the slot is emptied, which is what revokes outstanding
//! pointers to it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::value::{fault, tags, Value};

/// The slot's value was moved in as a parameter and must be consumed before
/// the frame is popped.
pub const MOVED: u8 = 0b0000_0001;
/// The slot survives a frame pop (static registers use this).
pub const KEEP: u8 = 0b0000_0010;
/// The slot's value has been captured by a closure.
pub const BOUND: u8 = 0b0000_0100;

#[derive(Debug, Default)]
struct Slot {
    value: Value,
    flags: u8,
    token: Option<Arc<AtomicBool>>,
}

impl Slot {
    /// Kill the liveness token, revoking pointers into this slot.
    fn revoke(&mut self) {
        if let Some(token) = self.token.take() {
            token.store(false, Ordering::Release);
        }
    }
}

/// A fixed-capacity register set. Every set has a VM-unique id so register
/// pointers can name their target set without borrowing into it.
#[derive(Debug)]
pub struct RegisterSet {
    id: u64,
    slots: Vec<Slot>,
}

impl Default for RegisterSet {
    fn default() -> Self {
        RegisterSet::new(0)
    }
}

impl RegisterSet {
    pub fn new(capacity: usize) -> RegisterSet {
        static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        RegisterSet {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            slots,
        }
    }

    pub fn set_id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&Slot, Value> {
        self.slots.get(index).ok_or_else(|| self.out_of_bounds(index))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot, Value> {
        let capacity = self.capacity();
        self.slots
            .get_mut(index)
            .ok_or_else(|| out_of_bounds(index, capacity))
    }

    fn out_of_bounds(&self, index: usize) -> Value {
        out_of_bounds(index, self.capacity())
    }

    pub fn get(&self, index: usize) -> Result<&Value, Value> {
        Ok(&self.slot(index)?.value)
    }

    /// In-place access. Mutating through this reference does not revoke
    /// pointers: the slot stays defined.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut Value, Value> {
        Ok(&mut self.slot_mut(index)?.value)
    }

    /// Overwrite a slot. The slot stays defined, so existing pointers now see
    /// the new value.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Value> {
        let slot = self.slot_mut(index)?;
        slot.value = value;
        slot.flags &= !MOVED;
        Ok(())
    }

    /// Move a slot's value out, leaving void and revoking pointers.
    pub fn take(&mut self, index: usize) -> Result<Value, Value> {
        let slot = self.slot_mut(index)?;
        slot.revoke();
        slot.flags = 0;
        Ok(std::mem::take(&mut slot.value))
    }

    /// Empty a slot, dropping its value.
    pub fn erase(&mut self, index: usize) -> Result<(), Value> {
        self.take(index).map(drop)
    }

    /// Explicitly invalidate pointers to a slot without emptying it.
    pub fn expire(&mut self, index: usize) -> Result<(), Value> {
        self.slot_mut(index)?.revoke();
        Ok(())
    }

    pub fn is_defined(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map(|slot| !slot.value.is_void())
            .unwrap_or(false)
    }

    pub fn flag(&mut self, index: usize, flag: u8) -> Result<(), Value> {
        self.slot_mut(index)?.flags |= flag;
        Ok(())
    }

    pub fn unflag(&mut self, index: usize, flag: u8) -> Result<(), Value> {
        self.slot_mut(index)?.flags &= !flag;
        Ok(())
    }

    pub fn is_flagged(&self, index: usize, flag: u8) -> Result<bool, Value> {
        Ok(self.slot(index)?.flags & flag != 0)
    }

    /// The liveness token for a slot, creating one on first use. Pointer
    /// creation requires the slot to be defined.
    pub fn pointer_token(&mut self, index: usize) -> Result<Arc<AtomicBool>, Value> {
        let slot = self.slot_mut(index)?;
        if slot.value.is_void() {
            return Err(fault(
                tags::INVALID_POINTER,
                format!("cannot take a pointer to empty register {index}"),
            ));
        }
        Ok(slot
            .token
            .get_or_insert_with(|| Arc::new(AtomicBool::new(true)))
            .clone())
    }

    /// The index of a slot that is still flagged MOVED and defined, if any.
    /// Such a slot at frame pop means a moved-in parameter was never consumed.
    pub fn unconsumed_moved(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.flags & MOVED != 0 && !slot.value.is_void())
    }

    /// Iterate over defined slots, for diagnostics.
    pub fn defined(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.value.is_void())
            .map(|(i, slot)| (i, &slot.value))
    }
}

impl Drop for RegisterSet {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            slot.revoke();
        }
    }
}

fn out_of_bounds(index: usize, capacity: usize) -> Value {
    fault(
        tags::OUT_OF_BOUNDS,
        format!("register index {index} out of bounds (capacity {capacity})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_is_bounds_checked() {
        let mut set = RegisterSet::new(4);
        assert!(set.get(3).is_ok());
        assert!(set.get(4).is_err());
        assert!(set.set(4, Value::Int(1)).is_err());
        assert!(set.take(17).is_err());
    }

    #[test]
    fn take_leaves_void_and_revokes_pointers() {
        let mut set = RegisterSet::new(2);
        set.set(1, Value::Int(42)).unwrap();
        let token = set.pointer_token(1).unwrap();
        assert!(token.load(Ordering::Acquire));

        let value = set.take(1).unwrap();
        assert!(value.deep_eq(&Value::Int(42)));
        assert!(set.get(1).unwrap().is_void());
        assert!(!token.load(Ordering::Acquire));
    }

    #[test]
    fn overwrite_keeps_pointers_live() {
        let mut set = RegisterSet::new(2);
        set.set(0, Value::Int(1)).unwrap();
        let token = set.pointer_token(0).unwrap();
        set.set(0, Value::Int(2)).unwrap();
        assert!(token.load(Ordering::Acquire));
    }

    #[test]
    fn pointer_to_empty_register_is_refused() {
        let mut set = RegisterSet::new(1);
        assert!(set.pointer_token(0).is_err());
    }

    #[test]
    fn moved_flag_tracks_consumption() {
        let mut set = RegisterSet::new(2);
        set.set(0, Value::Int(7)).unwrap();
        set.flag(0, MOVED).unwrap();
        assert_eq!(set.unconsumed_moved(), Some(0));

        let _ = set.take(0).unwrap();
        assert_eq!(set.unconsumed_moved(), None);
    }

    #[test]
    fn set_clears_moved() {
        let mut set = RegisterSet::new(1);
        set.set(0, Value::Int(7)).unwrap();
        set.flag(0, MOVED).unwrap();
        set.set(0, Value::Int(8)).unwrap();
        assert!(!set.is_flagged(0, MOVED).unwrap());
    }
}
