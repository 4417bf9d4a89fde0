//! Deferred reclamation of objects retired by the realtime thread.

use rtrb::PushError;

/// Create a new maid with room for `capacity` retired objects.
///
/// The [`MaidHandle`] lives on the realtime thread, the [`Maid`] on a
/// thread that is allowed to free memory.
pub fn maid<T: Send + 'static>(capacity: usize) -> (MaidHandle<T>, Maid<T>) {
    let (tx, rx) = rtrb::RingBuffer::<T>::new(capacity);

    (MaidHandle { tx }, Maid { rx })
}

/// The realtime side of a [`Maid`].
pub struct MaidHandle<T> {
    tx: rtrb::Producer<T>,
}

impl<T> MaidHandle<T> {
    /// Queue an object for deletion.
    ///
    /// This never allocates or blocks. If the queue is full the object
    /// is handed back to the caller.
    #[inline]
    pub fn push(&mut self, object: T) -> Result<(), T> {
        self.tx.push(object).map_err(|e| {
            let PushError::Full(object) = e;
            object
        })
    }

    /// The number of objects that can be pushed before the queue is full.
    #[inline]
    pub fn slots(&self) -> usize {
        self.tx.slots()
    }
}

/// Frees objects retired by the realtime thread.
pub struct Maid<T> {
    rx: rtrb::Consumer<T>,
}

impl<T> Maid<T> {
    /// Free everything that has been queued so far.
    ///
    /// Returns the number of objects freed.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_with(drop)
    }

    /// Pop everything that has been queued so far and hand each object
    /// to `f`.
    pub fn cleanup_with(&mut self, mut f: impl FnMut(T)) -> usize {
        let mut count = 0;
        while let Ok(object) = self.rx.pop() {
            f(object);
            count += 1;
        }
        count
    }

    /// The number of objects waiting to be freed.
    pub fn pending(&self) -> usize {
        self.rx.slots()
    }
}

impl<T> Drop for Maid<T> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn objects_are_freed_only_on_cleanup() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut handle, mut maid) = maid::<DropCounter>(4);

        for _ in 0..3 {
            assert!(handle.push(DropCounter(Arc::clone(&drops))).is_ok());
        }

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(maid.pending(), 3);
        assert_eq!(handle.slots(), 1);

        assert_eq!(maid.cleanup(), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(maid.pending(), 0);
    }

    #[test]
    fn full_queue_hands_object_back() {
        let (mut handle, mut maid) = maid::<u32>(1);

        assert!(handle.push(1).is_ok());
        assert_eq!(handle.push(2), Err(2));

        let mut seen = Vec::new();
        maid.cleanup_with(|v| seen.push(v));
        assert_eq!(seen, vec![1]);

        assert!(handle.push(3).is_ok());
    }

    #[test]
    fn cleanup_from_another_thread() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut handle, mut maid) = maid::<DropCounter>(16);

        for _ in 0..16 {
            let _ = handle.push(DropCounter(Arc::clone(&drops)));
        }

        std::thread::spawn(move || {
            maid.cleanup();
        })
        .join()
        .unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 16);
    }
}
