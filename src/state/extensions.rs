//! Per-instance storage owned by other subsystems.
//!
//! Subsystems that live outside this crate (memory manager, bytecode
//! engine) keep their per-instance state here, keyed by type. They install
//! it from an `on_instance_created` hook and remove it from
//! `on_instance_destroyed`, so it is created and torn down with the
//! instance.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Type-keyed map with at most one value per type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the previous value of the same type.
    pub fn insert<T: Send + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|prev| *prev)
    }

    pub fn get<T: Send + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// The stored value of type `T`, inserting `T::default()` first if absent.
    pub fn get_or_default<T: Send + Default + 'static>(&mut self) -> &mut T {
        let slot = self
            .map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        match slot.downcast_mut::<T>() {
            Some(value) => value,
            // Keys are derived from the stored type.
            None => unreachable!("extension slot holds a foreign type"),
        }
    }

    pub fn remove<T: Send + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T: Send + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct HeapStats {
        arenas: usize,
    }

    #[test]
    fn test_insert_get_remove() {
        let mut ext = Extensions::new();
        assert!(ext.insert(HeapStats { arenas: 2 }).is_none());
        assert_eq!(ext.get::<HeapStats>(), Some(&HeapStats { arenas: 2 }));

        let prev = ext.insert(HeapStats { arenas: 3 });
        assert_eq!(prev, Some(HeapStats { arenas: 2 }));

        assert_eq!(ext.remove::<HeapStats>(), Some(HeapStats { arenas: 3 }));
        assert!(ext.is_empty());
    }

    #[test]
    fn test_types_do_not_collide() {
        let mut ext = Extensions::new();
        ext.insert(7u32);
        ext.insert(7u64);
        *ext.get_mut::<u32>().unwrap() += 1;
        assert_eq!(ext.get::<u32>(), Some(&8));
        assert_eq!(ext.get::<u64>(), Some(&7));
        assert_eq!(ext.len(), 2);
    }

    #[test]
    fn test_get_or_default() {
        let mut ext = Extensions::new();
        ext.get_or_default::<HeapStats>().arenas += 4;
        assert_eq!(ext.get::<HeapStats>().map(|s| s.arenas), Some(4));
    }
}
