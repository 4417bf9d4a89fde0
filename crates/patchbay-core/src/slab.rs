//! Fixed-capacity storage for the realtime thread.
//!
//! Handles are allocated on the control side with a [`SlotAllocator`],
//! and the realtime side stores the matching values in an [`RtSlab`]
//! indexed by the handle's slot. An [`RtSlab`] never allocates: when the
//! allocator outgrows it, the control side builds a larger
//! [`SlabStorage`] and the realtime side swaps it in with
//! [`RtSlab::grow`].

use thunderdome::{Arena, Index};

struct Entry<T> {
    idx: Index,
    value: T,
}

/// Pre-allocated backing storage for an [`RtSlab`].
pub struct SlabStorage<T> {
    slots: Vec<Option<Entry<T>>>,
}

impl<T> SlabStorage<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// A realtime-safe map from handle to value.
pub struct RtSlab<T> {
    storage: SlabStorage<T>,
    len: usize,
}

impl<T> RtSlab<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: SlabStorage::new(capacity),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the value for the handle, checking its generation.
    #[inline]
    pub fn get(&self, idx: Index) -> Option<&T> {
        match self.storage.slots.get(idx.slot() as usize) {
            Some(Some(entry)) if entry.idx == idx => Some(&entry.value),
            _ => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, idx: Index) -> Option<&mut T> {
        match self.storage.slots.get_mut(idx.slot() as usize) {
            Some(Some(entry)) if entry.idx == idx => Some(&mut entry.value),
            _ => None,
        }
    }

    pub fn contains(&self, idx: Index) -> bool {
        self.get(idx).is_some()
    }

    /// Insert a value at the handle's slot.
    ///
    /// On success the value previously stored in that slot (of any
    /// generation) is returned so the caller can retire it. If the slot
    /// is out of range the value is handed back as an error.
    pub fn insert(&mut self, idx: Index, value: T) -> Result<Option<T>, T> {
        let Some(slot) = self.storage.slots.get_mut(idx.slot() as usize) else {
            return Err(value);
        };

        let prev = slot.replace(Entry { idx, value }).map(|e| e.value);
        if prev.is_none() {
            self.len += 1;
        }

        Ok(prev)
    }

    /// Remove the value for the handle, checking its generation.
    pub fn remove(&mut self, idx: Index) -> Option<T> {
        let slot = self.storage.slots.get_mut(idx.slot() as usize)?;

        if !matches!(slot, Some(entry) if entry.idx == idx) {
            return None;
        }

        self.len -= 1;
        slot.take().map(|e| e.value)
    }

    /// Move every value into `storage` and return the old storage.
    ///
    /// The old storage is empty but still owns its allocation, so it
    /// must be retired rather than dropped on the realtime thread. If
    /// `storage` is not larger than the current one it is handed back
    /// untouched.
    pub fn grow(&mut self, mut storage: SlabStorage<T>) -> SlabStorage<T> {
        if storage.capacity() <= self.capacity() {
            return storage;
        }

        for (new_slot, old_slot) in storage
            .slots
            .iter_mut()
            .zip(self.storage.slots.iter_mut())
        {
            *new_slot = old_slot.take();
        }

        std::mem::swap(&mut self.storage, &mut storage);
        storage
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.storage
            .slots
            .iter()
            .filter_map(|s| s.as_ref().map(|e| (e.idx, &e.value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Index, &mut T)> {
        self.storage
            .slots
            .iter_mut()
            .filter_map(|s| s.as_mut().map(|e| (e.idx, &mut e.value)))
    }

    /// Take the storage out, leaving an empty slab of zero capacity.
    pub fn take_storage(&mut self) -> SlabStorage<T> {
        self.len = 0;
        std::mem::replace(&mut self.storage, SlabStorage { slots: Vec::new() })
    }
}

/// Allocates generational handles on the control side and tracks the
/// capacity the realtime side has been given.
#[derive(Clone)]
pub struct SlotAllocator {
    arena: Arena<()>,
    rt_capacity: usize,
}

impl SlotAllocator {
    pub fn new(rt_capacity: usize) -> Self {
        Self {
            arena: Arena::with_capacity(rt_capacity),
            rt_capacity,
        }
    }

    /// Allocate a new handle.
    ///
    /// If the handle's slot does not fit into the realtime slab, the
    /// new required capacity is returned as well. The caller must then
    /// ship a [`SlabStorage`] of at least that capacity to the realtime
    /// side before the handle is used there.
    pub fn alloc(&mut self) -> (Index, Option<usize>) {
        let idx = self.arena.insert(());
        let slot = idx.slot() as usize;

        if slot < self.rt_capacity {
            return (idx, None);
        }

        self.rt_capacity = (self.rt_capacity * 2).max(slot + 1);
        (idx, Some(self.rt_capacity))
    }

    /// Free a handle so its slot can be reused.
    pub fn free(&mut self, idx: Index) -> bool {
        self.arena.remove(idx).is_some()
    }

    pub fn contains(&self, idx: Index) -> bool {
        self.arena.contains(idx)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn rt_capacity(&self) -> usize {
        self.rt_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut alloc = SlotAllocator::new(4);
        let mut slab = RtSlab::<u32>::new(alloc.rt_capacity());

        let (a, grow) = alloc.alloc();
        assert!(grow.is_none());
        let (b, _) = alloc.alloc();

        assert_eq!(slab.insert(a, 1).ok(), Some(None));
        assert_eq!(slab.insert(b, 2).ok(), Some(None));
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get(a), Some(&1));
        assert_eq!(slab.get(b), Some(&2));

        assert_eq!(slab.remove(a), Some(1));
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut alloc = SlotAllocator::new(4);
        let mut slab = RtSlab::<u32>::new(alloc.rt_capacity());

        let (a, _) = alloc.alloc();
        slab.insert(a, 1).ok();
        slab.remove(a);
        alloc.free(a);

        // The slot is reused with a new generation.
        let (b, _) = alloc.alloc();
        assert_eq!(a.slot(), b.slot());
        slab.insert(b, 2).ok();

        assert_eq!(slab.get(a), None);
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.get(b), Some(&2));
    }

    #[test]
    fn growth_is_a_swap() {
        let mut alloc = SlotAllocator::new(2);
        let mut slab = RtSlab::<u32>::new(alloc.rt_capacity());

        let (a, _) = alloc.alloc();
        let (b, _) = alloc.alloc();
        slab.insert(a, 1).ok();
        slab.insert(b, 2).ok();

        let (c, grow) = alloc.alloc();
        let new_cap = grow.unwrap();
        assert!(new_cap > 2);

        // Without growing, the handle does not fit.
        assert_eq!(slab.insert(c, 3), Err(3));

        let old = slab.grow(SlabStorage::new(new_cap));
        assert_eq!(old.capacity(), 2);
        assert_eq!(slab.capacity(), new_cap);

        assert_eq!(slab.insert(c, 3).ok(), Some(None));
        assert_eq!(slab.get(a), Some(&1));
        assert_eq!(slab.get(b), Some(&2));
        assert_eq!(slab.get(c), Some(&3));
        assert_eq!(slab.len(), 3);
    }

    #[test]
    fn smaller_storage_is_handed_back() {
        let mut slab = RtSlab::<u32>::new(8);
        let s = slab.grow(SlabStorage::new(4));
        assert_eq!(s.capacity(), 4);
        assert_eq!(slab.capacity(), 8);
    }
}
