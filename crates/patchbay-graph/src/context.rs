//! Marker types for the threads the engine runs on.
//!
//! Operations that may only run on one thread take a reference to the
//! matching marker. The markers can only be created by the engine, so
//! code outside of it can't call those operations at all.

use std::cell::Cell;
use std::marker::PhantomData;

/// Proof that the caller runs in the control context, where events
/// are pre-processed and the object store is mutated.
///
/// The control context may allocate, lock, and block.
#[derive(Debug)]
pub struct ControlContext {
    _not_sync: PhantomData<Cell<()>>,
}

impl ControlContext {
    pub(crate) fn new() -> Self {
        Self {
            _not_sync: PhantomData,
        }
    }
}

/// Proof that the caller runs in the realtime context, where events
/// are executed and nodes are processed.
///
/// The realtime context must never allocate, free, lock, or block.
#[derive(Debug)]
pub struct RealtimeContext {
    _not_sync: PhantomData<Cell<()>>,
}

impl RealtimeContext {
    pub(crate) fn new() -> Self {
        Self {
            _not_sync: PhantomData,
        }
    }
}
