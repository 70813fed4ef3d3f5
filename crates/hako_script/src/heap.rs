//! Per-context table of guest values held by the host
//!
//! Each slot owns exactly one engine reference count. References are handed
//! out monotonically and never reused, so a stale `RawRef` can never alias a
//! newer value.

use crate::error::BridgeError;
use crate::ffi::RawRef;
use rquickjs::{Ctx, Persistent, Value};
use std::collections::HashMap;

pub(crate) type Slot = Persistent<Value<'static>>;

pub(crate) struct ValueHeap {
    slots: HashMap<u32, Slot>,
    next: u32,
}

impl ValueHeap {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next: RawRef::FIRST_SLOT,
        }
    }

    pub fn store<'js>(&mut self, ctx: &Ctx<'js>, value: Value<'js>) -> Result<RawRef, BridgeError> {
        self.insert(Persistent::save(ctx, value))
    }

    /// Take ownership of an engine reference that is already counted.
    pub fn insert(&mut self, slot: Slot) -> Result<RawRef, BridgeError> {
        let raw = self.next;
        self.next = raw
            .checked_add(1)
            .ok_or_else(|| BridgeError::integrity("value heap exhausted its reference space"))?;
        self.slots.insert(raw, slot);
        Ok(RawRef(raw))
    }

    pub fn contains(&self, raw: RawRef) -> bool {
        self.slots.contains_key(&raw.0)
    }

    /// Duplicate the slot's engine reference.
    pub fn get(&self, raw: RawRef) -> Option<Slot> {
        self.slots.get(&raw.0).cloned()
    }

    /// Detach a slot. The caller drops it outside of any heap borrow, since
    /// releasing the last reference may run finalizers that touch the heap.
    pub fn remove(&mut self, raw: RawRef) -> Option<Slot> {
        self.slots.remove(&raw.0)
    }

    pub fn drain(&mut self) -> Vec<(RawRef, Slot)> {
        self.slots.drain().map(|(raw, slot)| (RawRef(raw), slot)).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
