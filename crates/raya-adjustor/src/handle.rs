//! Stable handles: references that pin a managed value while native code
//! holds them
//!
//! The adjustor only ever releases handles. Acquiring one is the caller's
//! job, done before `build` and handed over with the stub.

use std::fmt;
use std::num::NonZeroU32;

use parking_lot::Mutex;

use crate::error::{AdjustorError, AdjustorResult};

/// Opaque reference into the managed runtime's handle table.
///
/// Zero is never a valid handle, so a zeroed stub field never decodes.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Wrap a raw handle value, rejecting zero
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Handle)
    }

    /// Raw value embedded in stubs
    pub fn as_raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0.get())
    }
}

/// The part of the managed runtime's handle table the reaper needs
pub trait HandleTable: Send + Sync {
    /// Drop the reference `handle` holds. The value may be collected once
    /// nothing else refers to it.
    fn release(&self, handle: Handle);
}

struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<u32>,
}

/// A simple thread-safe handle table.
///
/// Handle `n` refers to slot `n - 1`. Released slots are reused.
pub struct StableHandleTable<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> StableHandleTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        StableHandleTable {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Pin `value` and return a handle for it.
    ///
    /// Fails with [`AdjustorError::HandlesExhausted`] once every handle value
    /// is in use; `value` is dropped in that case.
    pub fn acquire(&self, value: T) -> AdjustorResult<Handle> {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            slots.entries[index as usize] = Some(value);
            return handle_for_slot(index as usize).ok_or(AdjustorError::HandlesExhausted);
        }
        let handle = handle_for_slot(slots.entries.len()).ok_or(AdjustorError::HandlesExhausted)?;
        slots.entries.push(Some(value));
        Ok(handle)
    }

    /// Remove the value behind `handle`, returning it
    pub fn take(&self, handle: Handle) -> Option<T> {
        let mut slots = self.slots.lock();
        let index = handle.as_raw() - 1;
        let value = slots.entries.get_mut(index as usize)?.take()?;
        slots.free.push(index);
        Some(value)
    }

    /// Whether `handle` currently refers to a value
    pub fn contains(&self, handle: Handle) -> bool {
        let slots = self.slots.lock();
        matches!(slots.entries.get(handle.as_raw() as usize - 1), Some(Some(_)))
    }

    /// Number of live handles
    pub fn live_count(&self) -> usize {
        let slots = self.slots.lock();
        slots.entries.len() - slots.free.len()
    }
}

/// Handle for slot `index`, if it has one
fn handle_for_slot(index: usize) -> Option<Handle> {
    let index = u32::try_from(index).ok()?;
    NonZeroU32::new(index.checked_add(1)?).map(Handle)
}

impl<T: Clone> StableHandleTable<T> {
    /// Clone of the value behind `handle`
    pub fn get(&self, handle: Handle) -> Option<T> {
        let slots = self.slots.lock();
        slots.entries.get(handle.as_raw() as usize - 1)?.clone()
    }
}

impl<T> Default for StableHandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> HandleTable for StableHandleTable<T> {
    fn release(&self, handle: Handle) {
        if self.take(handle).is_none() {
            log::warn!("release of stale handle {:?}", handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_not_a_handle() {
        assert!(Handle::from_raw(0).is_none());
        assert_eq!(Handle::from_raw(5).unwrap().as_raw(), 5);
    }

    #[test]
    fn test_acquire_get_release() {
        let table = StableHandleTable::new();
        let a = table.acquire("closure-a".to_string()).unwrap();
        let b = table.acquire("closure-b".to_string()).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.live_count(), 2);
        assert_eq!(table.get(a).as_deref(), Some("closure-a"));

        table.release(a);
        assert!(!table.contains(a));
        assert!(table.contains(b));
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.get(a), None);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let table = StableHandleTable::new();
        let a = table.acquire(1u32).unwrap();
        table.release(a);
        let b = table.acquire(2u32).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.get(b), Some(2));
    }

    #[test]
    fn test_double_release_is_ignored() {
        let table = StableHandleTable::new();
        let a = table.acquire(1u32).unwrap();
        let _b = table.acquire(2u32).unwrap();
        table.release(a);
        table.release(a);
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_slot_handles_stop_at_u32_max() {
        assert_eq!(handle_for_slot(0).map(Handle::as_raw), Some(1));
        assert_eq!(
            handle_for_slot(u32::MAX as usize - 1).map(Handle::as_raw),
            Some(u32::MAX)
        );
        assert!(handle_for_slot(u32::MAX as usize).is_none());
        #[cfg(target_pointer_width = "64")]
        assert!(handle_for_slot(u32::MAX as usize + 1).is_none());
    }

    #[test]
    fn test_unknown_handle() {
        let table: StableHandleTable<u32> = StableHandleTable::new();
        let h = Handle::from_raw(42).unwrap();
        assert!(!table.contains(h));
        assert_eq!(table.take(h), None);
    }
}
