//! Generation-checked resource arena.
//!
//! GPU objects that outlive a single frame are stored in a
//! [`ResourceArena`] owned by the context that created them (the scene for
//! acceleration structures). Callers hold [`Handle`]s, which stop resolving
//! once their slot has been removed, even if the slot is later reused.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{RhiError, RhiResult};

/// Typed index into a [`ResourceArena`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot vector with generation counters and a free list.
pub struct ResourceArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> ResourceArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Stores `value`, reusing a freed slot when one exists.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
                _marker: PhantomData,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
            _marker: PhantomData,
        }
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    fn stale(handle: Handle<T>) -> RhiError {
        RhiError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> RhiResult<&T> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| Self::stale(handle))
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> RhiResult<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or_else(|| Self::stale(handle))
    }

    #[inline]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Removes and returns the value. The slot's generation is bumped so
    /// every outstanding handle to it goes stale.
    pub fn remove(&mut self, handle: Handle<T>) -> RhiResult<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| Self::stale(handle))?;
        let value = slot.value.take().ok_or_else(|| Self::stale(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(value)
    }

    /// Removes every value, newest slot first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                values.push(value);
            }
        }
        self.len = 0;
        values
    }

    /// Live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for ResourceArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = ResourceArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(*arena.get(a).unwrap(), "a");
        assert_eq!(*arena.get(b).unwrap(), "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_removed_handle_is_stale() {
        let mut arena = ResourceArena::new();
        let a = arena.insert(1);
        assert_eq!(arena.remove(a).unwrap(), 1);
        assert!(matches!(
            arena.get(a),
            Err(RhiError::StaleHandle { index: 0, generation: 0 })
        ));
        assert!(arena.remove(a).is_err());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_reused_slot_does_not_resolve_old_handle() {
        let mut arena = ResourceArena::new();
        let old = arena.insert(10);
        arena.remove(old).unwrap();
        let new = arena.insert(20);

        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(arena.get(old).is_err());
        assert_eq!(*arena.get(new).unwrap(), 20);
    }

    #[test]
    fn test_get_mut_updates_value() {
        let mut arena = ResourceArena::new();
        let h = arena.insert(vec![1]);
        arena.get_mut(h).unwrap().push(2);
        assert_eq!(arena.get(h).unwrap(), &vec![1, 2]);
    }

    #[test]
    fn test_drain_returns_newest_first_and_invalidates() {
        let mut arena = ResourceArena::new();
        let a = arena.insert('a');
        let _b = arena.insert('b');
        let _c = arena.insert('c');
        assert_eq!(arena.drain(), vec!['c', 'b', 'a']);
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
    }
}
