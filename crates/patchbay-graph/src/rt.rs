//! State owned by the realtime thread.

use std::cell::UnsafeCell;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use patchbay_core::{
    node::{ProcInfo, ProcessingUnit},
    slab::{RtSlab, SlabStorage},
    Buffer, BufferFactory,
};

use crate::graph::{BufferId, CompiledPatch, NodeHandle};

/// A signal buffer that the schedule hands out by shared or exclusive
/// reference depending on the step.
pub(crate) struct BufferCell(UnsafeCell<Buffer>);

impl BufferCell {
    pub fn new(buffer: Buffer) -> Self {
        Self(UnsafeCell::new(buffer))
    }

    pub fn into_inner(self) -> Buffer {
        self.0.into_inner()
    }
}

/// Get a shared reference to a buffer.
///
/// # Safety
///
/// No exclusive reference to the same buffer may be alive.
#[inline]
pub(crate) unsafe fn buffer_ref(buffers: &RtSlab<BufferCell>, id: BufferId) -> Option<&Buffer> {
    buffers.get(id.0).map(|cell| &*cell.0.get())
}

/// Get an exclusive reference to a buffer.
///
/// # Safety
///
/// No other reference to the same buffer may be alive.
#[inline]
#[allow(clippy::mut_from_ref)]
pub(crate) unsafe fn buffer_mut(
    buffers: &RtSlab<BufferCell>,
    id: BufferId,
) -> Option<&mut Buffer> {
    buffers.get(id.0).map(|cell| &mut *cell.0.get())
}

pub(crate) enum RtUnit {
    Plugin(Box<dyn ProcessingUnit>),
    Patch(RtPatch),
}

pub(crate) struct RtPatch {
    pub enabled: bool,
    pub order: Option<Box<CompiledPatch>>,
}

/// Moves samples between ports that run in different execution
/// contexts.
pub(crate) struct TransferQueue {
    tx: rtrb::Producer<f32>,
    rx: rtrb::Consumer<f32>,
    dropped: Arc<AtomicU64>,
}

impl TransferQueue {
    pub fn new(capacity: usize, dropped: Arc<AtomicU64>) -> Self {
        let (tx, rx) = rtrb::RingBuffer::new(capacity.max(1));
        Self { tx, rx, dropped }
    }

    /// Push the voice sum of `srcs` into the queue. Samples that don't
    /// fit are dropped and counted.
    pub fn enqueue(&mut self, srcs: &[&Buffer], frames: usize) {
        let Some(first) = srcs.first() else {
            return;
        };

        if first.port_type() == patchbay_core::PortType::Control {
            let v: f32 = srcs.iter().map(|b| b.samples()[0]).sum();
            if self.tx.push(v).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let frames = frames.min(first.samples().len());
        for i in 0..frames {
            let v: f32 = srcs
                .iter()
                .map(|b| b.samples().get(i).copied().unwrap_or(0.0))
                .sum();

            if self.tx.push(v).is_err() {
                self.dropped
                    .fetch_add((frames - i) as u64, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Pop queued data into `dst`. Missing audio samples read as silence,
    /// and a control destination keeps the newest value.
    pub fn dequeue(&mut self, dst: &mut Buffer, frames: usize) {
        if dst.port_type() == patchbay_core::PortType::Control {
            while let Ok(v) = self.rx.pop() {
                dst.samples_mut()[0] = v;
            }
            return;
        }

        let out = dst.samples_mut();
        let frames = frames.min(out.len());
        for s in out[..frames].iter_mut() {
            *s = self.rx.pop().unwrap_or(0.0);
        }
    }
}

/// Counters the realtime thread bumps instead of reporting errors
/// directly.
#[derive(Debug, Default)]
pub(crate) struct RtDiagnostics {
    /// Steps skipped because a handle did not resolve.
    pub skipped_steps: AtomicU64,
    /// Objects leaked because there was no room to retire them.
    pub lost_objects: AtomicU64,
}

impl RtDiagnostics {
    #[inline]
    pub fn skip_step(&self) {
        self.skipped_steps.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the realtime thread processes.
pub(crate) struct RtGraph {
    pub units: RtSlab<RtUnit>,
    pub buffers: RtSlab<BufferCell>,
    pub queues: RtSlab<TransferQueue>,
    pub root: NodeHandle,
    pub diagnostics: Arc<RtDiagnostics>,
}

impl RtGraph {
    pub fn new(
        unit_capacity: usize,
        buffer_capacity: usize,
        queue_capacity: usize,
        root: NodeHandle,
        diagnostics: Arc<RtDiagnostics>,
    ) -> Self {
        Self {
            units: RtSlab::new(unit_capacity),
            buffers: RtSlab::new(buffer_capacity),
            queues: RtSlab::new(queue_capacity),
            root,
            diagnostics,
        }
    }

    /// Take everything out of the graph without allocating.
    pub fn take(&mut self) -> RtGraph {
        RtGraph {
            units: std::mem::replace(&mut self.units, RtSlab::new(0)),
            buffers: std::mem::replace(&mut self.buffers, RtSlab::new(0)),
            queues: std::mem::replace(&mut self.queues, RtSlab::new(0)),
            root: self.root,
            diagnostics: Arc::clone(&self.diagnostics),
        }
    }

    pub fn patch(&self, handle: NodeHandle) -> Option<&RtPatch> {
        match self.units.get(handle.0) {
            Some(RtUnit::Patch(p)) => Some(p),
            _ => None,
        }
    }

    /// Run the process order of a patch, or silence its outputs if it
    /// is disabled.
    pub fn run_patch(&mut self, handle: NodeHandle, proc_info: &ProcInfo) {
        let Some(RtUnit::Patch(patch)) = self.units.get_mut(handle.0) else {
            self.diagnostics.skip_step();
            return;
        };

        let enabled = patch.enabled;
        let Some(order) = patch.order.take() else {
            return;
        };

        if enabled {
            order.process(self, proc_info);
        } else {
            order.silence_outputs(self);
        }

        match self.units.get_mut(handle.0) {
            Some(RtUnit::Patch(patch)) => patch.order = Some(order),
            _ => {
                // Never free on this thread.
                self.diagnostics
                    .lost_objects
                    .fetch_add(1, Ordering::Relaxed);
                std::mem::forget(order);
            }
        }
    }
}

/// Objects displaced by one event, freed together by the maid.
///
/// Every vector is reserved before the event reaches the realtime
/// thread, so retiring never allocates.
#[derive(Default)]
pub(crate) struct Retired {
    pub units: Vec<RtUnit>,
    pub buffers: Vec<BufferCell>,
    pub queues: Vec<TransferQueue>,
    pub orders: Vec<Box<CompiledPatch>>,
    pub unit_storage: Vec<SlabStorage<RtUnit>>,
    pub buffer_storage: Vec<SlabStorage<BufferCell>>,
    pub queue_storage: Vec<SlabStorage<TransferQueue>>,
}

impl Retired {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
            && self.buffers.is_empty()
            && self.queues.is_empty()
            && self.orders.is_empty()
            && self.unit_storage.is_empty()
            && self.buffer_storage.is_empty()
            && self.queue_storage.is_empty()
    }

    /// Hand the retired buffers back to the factory and free the rest.
    pub fn recycle_into(mut self, factory: &BufferFactory) {
        for cell in self.buffers.drain(..) {
            factory.recycle(cell.into_inner());
        }
    }
}

/// Move `value` into `slot` if there is reserved room for it.
///
/// Otherwise the value is leaked, since freeing it here is never
/// allowed. Returns `false` in that case.
#[inline]
pub(crate) fn retire<T>(slot: &mut Vec<T>, value: T) -> bool {
    if slot.len() < slot.capacity() {
        slot.push(value);
        true
    } else {
        std::mem::forget(value);
        false
    }
}

/// An object queued for deletion by the realtime thread.
pub(crate) enum Garbage {
    Retired(Box<Retired>),
    Graph(RtGraph),
}
