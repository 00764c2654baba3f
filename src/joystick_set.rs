//! Joystick Set: a fixed-capacity (16), contiguous collection of tracked
//! devices. Insertion appends; removal swaps the last element into the
//! vacated slot (O(1), order not preserved).
//!
//! Each record's slot in the set is mirrored in a shared `Arc<AtomicUsize>`
//! back-pointer, held by whatever owns the record's registration elsewhere
//! (the per-device reader task in `device.rs`): readers tag every message
//! they send with the *current* value of that cell, so a message is
//! always attributed to the right slot even if a swap happened since
//! the reader last read it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const CAPACITY: usize = 16;

/// A back-pointer from a record's registration to the slot it currently
/// occupies in the set.
pub type SlotHandle = Arc<AtomicUsize>;

pub fn new_slot_handle(index: usize) -> SlotHandle {
    Arc::new(AtomicUsize::new(index))
}

/// Anything stored in a `JoystickSet` must carry the back-pointer
/// described above.
pub trait HasSlot {
    fn slot(&self) -> &SlotHandle;
}

#[derive(Debug, thiserror::Error)]
pub enum JoystickSetError {
    #[error("joystick set is at capacity ({CAPACITY})")]
    Overflow,
}

/// Fixed-capacity registry with swap-remove compaction.
#[derive(Debug, Default)]
pub struct JoystickSet<T: HasSlot> {
    records: Vec<T>,
}

impl<T: HasSlot> JoystickSet<T> {
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= CAPACITY
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.records.get_mut(index)
    }

    /// Appends `record` at the next free slot, setting its back-pointer.
    /// Precondition: `size < capacity`, checked here rather than by the
    /// caller so the invariant can't be violated by a forgetful call
    /// site.
    pub fn add(&mut self, record: T) -> Result<usize, JoystickSetError> {
        if self.is_full() {
            return Err(JoystickSetError::Overflow);
        }
        let index = self.records.len();
        record.slot().store(index, Ordering::SeqCst);
        self.records.push(record);
        Ok(index)
    }

    /// Removes the record at `index` via swap-with-last, returning it.
    /// Updates the moved record's back-pointer to its new (old `index`)
    /// position. Returns `None` if `index` is out of range.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.records.len() {
            return None;
        }
        let removed = self.records.swap_remove(index);
        if let Some(moved) = self.records.get(index) {
            moved.slot().store(index, Ordering::SeqCst);
        }
        Some(removed)
    }

    /// Removes every record, last-to-first. Returns them in removal
    /// order so the caller can tear down whatever resource each one
    /// owns (close fds, abort reader tasks, ...).
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.records.len());
        while let Some(record) = self.records.pop() {
            drained.push(record);
        }
        drained
    }

    /// Invariants that must hold after every insert/remove: every active
    /// slot's back-pointer equals its current index, and no two slots
    /// share a `key`.
    #[cfg(test)]
    pub fn check_invariants<K: PartialEq>(&self, key: impl Fn(&T) -> K) {
        for (i, record) in self.records.iter().enumerate() {
            assert_eq!(
                record.slot().load(Ordering::SeqCst),
                i,
                "slot back-pointer out of sync at index {i}"
            );
        }
        for i in 0..self.records.len() {
            for j in (i + 1)..self.records.len() {
                assert!(
                    key(&self.records[i]) != key(&self.records[j]),
                    "duplicate key at indices {i} and {j}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Dummy {
        id: u32,
        slot: SlotHandle,
    }

    impl HasSlot for Dummy {
        fn slot(&self) -> &SlotHandle {
            &self.slot
        }
    }

    fn dummy(id: u32) -> Dummy {
        Dummy {
            id,
            slot: new_slot_handle(0),
        }
    }

    #[test]
    fn add_then_remove_updates_back_pointer() {
        let mut set: JoystickSet<Dummy> = JoystickSet::new();
        let a = set.add(dummy(1)).unwrap();
        let b = set.add(dummy(2)).unwrap();
        let c = set.add(dummy(3)).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        // Remove the first: last element (id 3) swaps into slot 0.
        let removed = set.remove(0).unwrap();
        assert_eq!(removed.id, 1);
        assert_eq!(set.len(), 2);
        let moved = set.get(0).unwrap();
        assert_eq!(moved.id, 3);
        assert_eq!(moved.slot.load(Ordering::SeqCst), 0);
        set.check_invariants(|d| d.id);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut set: JoystickSet<Dummy> = JoystickSet::new();
        for i in 0..CAPACITY as u32 {
            set.add(dummy(i)).unwrap();
        }
        assert!(matches!(set.add(dummy(999)), Err(JoystickSetError::Overflow)));
        assert_eq!(set.len(), CAPACITY);
    }

    #[test]
    fn drain_empties_the_set() {
        let mut set: JoystickSet<Dummy> = JoystickSet::new();
        for i in 0..5 {
            set.add(dummy(i)).unwrap();
        }
        let drained = set.drain();
        assert_eq!(drained.len(), 5);
        assert!(set.is_empty());
    }

    // Property-based: for all sequences of add/remove, size never
    // exceeds capacity, no two records share an id, and every record's
    // back-pointer equals its current slot.
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add,
            RemoveAt(usize),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Add),
                (0usize..CAPACITY + 2).prop_map(Op::RemoveAt),
            ]
        }

        proptest! {
            #[test]
            fn invariants_hold_over_random_ops(ops in prop::collection::vec(op_strategy(), 0..200)) {
                let mut set: JoystickSet<Dummy> = JoystickSet::new();
                let mut next_id = 0u32;
                for op in ops {
                    match op {
                        Op::Add => {
                            if !set.is_full() {
                                set.add(dummy(next_id)).unwrap();
                                next_id += 1;
                            } else {
                                prop_assert!(set.add(dummy(next_id)).is_err());
                            }
                        }
                        Op::RemoveAt(i) => {
                            let _ = set.remove(i);
                        }
                    }
                    prop_assert!(set.len() <= CAPACITY);
                    set.check_invariants(|d| d.id);
                }
            }
        }
    }
}
