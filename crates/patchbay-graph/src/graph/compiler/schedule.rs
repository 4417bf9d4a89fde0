use arrayvec::ArrayVec;
use atomic_float::AtomicF32;
use smallvec::SmallVec;
use std::{
    fmt::Debug,
    sync::{atomic::Ordering, Arc},
};

use patchbay_core::{node::ProcInfo, Buffer, MAX_PORTS};

use crate::{
    graph::{BufferId, NodeHandle, QueueId},
    rt::{buffer_mut, buffer_ref, RtGraph},
};

/// A range into the flat I/O table of a [`CompiledPatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRange {
    pub start: u32,
    pub len: u32,
}

impl IoRange {
    fn as_range(&self) -> std::ops::Range<usize> {
        self.start as usize..(self.start + self.len) as usize
    }
}

/// One instruction of a compiled process order.
///
/// Steps only hold handles, so dropping them never frees memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Silence a buffer.
    Clear(BufferId),
    /// Sum `src` into `dst`.
    Mix { dst: BufferId, src: BufferId },
    /// Push the voice sum of the buffers in `srcs` into a transfer queue.
    Enqueue { queue: QueueId, srcs: IoRange },
    /// Pop a transfer queue into `dst`.
    Dequeue { queue: QueueId, dst: BufferId },
    /// Process every voice of a node.
    ///
    /// The buffers of voice `v` start at `io_offset + v * (num_inputs +
    /// num_outputs)`, inputs first.
    Run {
        node: NodeHandle,
        voices: u32,
        num_inputs: u32,
        num_outputs: u32,
        io_offset: u32,
    },
    /// Run the process order of a child patch.
    RunPatch(NodeHandle),
}

/// A [`CompiledPatch`] is the output of the process order compiler for
/// one patch.
pub struct CompiledPatch {
    pub(crate) steps: Vec<Step>,
    pub(crate) io: Vec<BufferId>,
    /// The child nodes and patches in process order.
    pub(crate) order: Vec<NodeHandle>,
    /// Buffers whose value is published after every cycle.
    pub(crate) monitors: Vec<(BufferId, Arc<AtomicF32>)>,
    /// The buffers of the boundary outputs, silenced while the patch is
    /// disabled.
    pub(crate) silence: Vec<BufferId>,
    /// The voice buffers of each audio boundary input, in port order.
    pub(crate) audio_inputs: Vec<SmallVec<[BufferId; 4]>>,
    /// The voice buffers each audio boundary output resolves to, in port
    /// order.
    pub(crate) audio_outputs: Vec<SmallVec<[BufferId; 4]>>,
}

impl Debug for CompiledPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "CompiledPatch {{")?;

        writeln!(f, "    steps: {{")?;
        for step in self.steps.iter() {
            match step {
                Step::Run {
                    node,
                    voices,
                    num_inputs,
                    num_outputs,
                    io_offset,
                } => {
                    let len = (*voices * (*num_inputs + *num_outputs)) as usize;
                    let start = *io_offset as usize;
                    writeln!(
                        f,
                        "        Run {:?} x{} | io: {:?}",
                        node,
                        voices,
                        &self.io[start..start + len]
                    )?;
                }
                Step::Enqueue { queue, srcs } => {
                    writeln!(
                        f,
                        "        Enqueue {:?} <- {:?}",
                        queue,
                        &self.io[srcs.as_range()]
                    )?;
                }
                step => writeln!(f, "        {:?}", step)?,
            }
        }
        writeln!(f, "    }}")?;

        writeln!(f, "    num_monitors: {}", self.monitors.len())?;

        writeln!(f, "}}")
    }
}

impl CompiledPatch {
    /// The child nodes and patches in process order.
    pub fn order(&self) -> &[NodeHandle] {
        &self.order
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step of this patch, then publish the monitored values.
    ///
    /// Steps whose handles no longer resolve are skipped and counted.
    pub(crate) fn process(&self, graph: &mut RtGraph, proc_info: &ProcInfo) {
        let frames = proc_info.frames;

        for step in self.steps.iter() {
            match *step {
                Step::Clear(id) => {
                    // SAFETY: No other buffer reference is alive between steps.
                    match unsafe { buffer_mut(&graph.buffers, id) } {
                        Some(b) => b.clear(),
                        None => graph.diagnostics.skip_step(),
                    }
                }
                Step::Mix { dst, src } => {
                    if dst == src {
                        continue;
                    }

                    // SAFETY: `dst` and `src` are different buffers, and no
                    // other buffer reference is alive between steps.
                    let (d, s) = unsafe {
                        (
                            buffer_mut(&graph.buffers, dst),
                            buffer_ref(&graph.buffers, src),
                        )
                    };

                    match (d, s) {
                        (Some(d), Some(s)) => d.accumulate(s),
                        _ => graph.diagnostics.skip_step(),
                    }
                }
                Step::Enqueue { queue, srcs } => {
                    let RtGraph {
                        buffers,
                        queues,
                        diagnostics,
                        ..
                    } = graph;

                    let Some(q) = queues.get_mut(queue.0) else {
                        diagnostics.skip_step();
                        continue;
                    };

                    let mut bufs: ArrayVec<&Buffer, MAX_PORTS> = ArrayVec::new();
                    for id in self.io[srcs.as_range()].iter() {
                        // SAFETY: Only shared references are taken here.
                        if let Some(b) = unsafe { buffer_ref(buffers, *id) } {
                            let _ = bufs.try_push(b);
                        }
                    }

                    q.enqueue(&bufs, frames);
                }
                Step::Dequeue { queue, dst } => {
                    let RtGraph {
                        buffers,
                        queues,
                        diagnostics,
                        ..
                    } = graph;

                    // SAFETY: No other buffer reference is alive between steps.
                    match (queues.get_mut(queue.0), unsafe { buffer_mut(buffers, dst) }) {
                        (Some(q), Some(d)) => q.dequeue(d, frames),
                        _ => diagnostics.skip_step(),
                    }
                }
                Step::Run {
                    node,
                    voices,
                    num_inputs,
                    num_outputs,
                    io_offset,
                } => {
                    self.run_node(
                        graph,
                        node,
                        voices as usize,
                        num_inputs as usize,
                        num_outputs as usize,
                        io_offset as usize,
                        proc_info,
                    );
                }
                Step::RunPatch(handle) => graph.run_patch(handle, proc_info),
            }
        }

        self.publish_monitors(graph);
    }

    #[allow(clippy::too_many_arguments)]
    fn run_node(
        &self,
        graph: &mut RtGraph,
        node: NodeHandle,
        voices: usize,
        num_inputs: usize,
        num_outputs: usize,
        io_offset: usize,
        proc_info: &ProcInfo,
    ) {
        let RtGraph {
            units,
            buffers,
            diagnostics,
            ..
        } = graph;

        let Some(crate::rt::RtUnit::Plugin(unit)) = units.get_mut(node.0) else {
            diagnostics.skip_step();
            return;
        };

        let stride = num_inputs + num_outputs;

        for voice in 0..voices {
            let base = io_offset + voice * stride;
            let Some(ids) = self.io.get(base..base + stride) else {
                diagnostics.skip_step();
                return;
            };

            let mut inputs: ArrayVec<&Buffer, MAX_PORTS> = ArrayVec::new();
            let mut outputs: ArrayVec<&mut Buffer, MAX_PORTS> = ArrayVec::new();
            let mut missing = false;

            for id in ids[..num_inputs].iter() {
                // SAFETY: The compiler never binds an output buffer of a
                // node to one of its own inputs, so the shared references
                // taken here never alias the exclusive ones below.
                match unsafe { buffer_ref(buffers, *id) } {
                    Some(b) => {
                        let _ = inputs.try_push(b);
                    }
                    None => missing = true,
                }
            }

            for id in ids[num_inputs..].iter() {
                // SAFETY: Every output of a node owns a distinct buffer.
                match unsafe { buffer_mut(buffers, *id) } {
                    Some(b) => {
                        let _ = outputs.try_push(b);
                    }
                    None => missing = true,
                }
            }

            if missing {
                diagnostics.skip_step();
                continue;
            }

            unit.process(voice, proc_info, inputs.as_slice(), outputs.as_mut_slice());
        }
    }

    fn publish_monitors(&self, graph: &RtGraph) {
        for (id, value) in self.monitors.iter() {
            // SAFETY: Only shared references are taken here.
            if let Some(b) = unsafe { buffer_ref(&graph.buffers, *id) } {
                value.store(b.value(), Ordering::Relaxed);
            }
        }
    }

    /// Silence the boundary outputs of a disabled patch.
    pub(crate) fn silence_outputs(&self, graph: &RtGraph) {
        for id in self.silence.iter() {
            // SAFETY: No other buffer reference is alive.
            if let Some(b) = unsafe { buffer_mut(&graph.buffers, *id) } {
                b.clear();
            }
        }

        self.publish_monitors(graph);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use patchbay_core::{
        node::{ProcessingUnit, StreamStatus},
        slab::SlotAllocator,
        PortType,
    };

    use super::*;
    use crate::rt::{BufferCell, RtDiagnostics, RtPatch, RtUnit, TransferQueue};

    /// Writes `input + offset` to its output.
    struct AddUnit(f32);

    impl ProcessingUnit for AddUnit {
        fn process(
            &mut self,
            voice: usize,
            _proc_info: &ProcInfo,
            inputs: &[&Buffer],
            outputs: &mut [&mut Buffer],
        ) {
            let v = inputs[0].value() + self.0 + voice as f32;
            outputs[0].set_value(v, 0);
        }
    }

    struct Fixture {
        slots: SlotAllocator,
        graph: RtGraph,
    }

    impl Fixture {
        fn new() -> Self {
            let mut slots = SlotAllocator::new(16);
            let root = NodeHandle(slots.alloc().0);
            let mut graph = RtGraph::new(16, 16, 16, root, Arc::new(RtDiagnostics::default()));
            graph
                .units
                .insert(
                    root.0,
                    RtUnit::Patch(RtPatch {
                        enabled: true,
                        order: None,
                    }),
                )
                .ok();

            Self { slots, graph }
        }

        fn buffer(&mut self, port_type: PortType) -> BufferId {
            let id = BufferId(self.slots.alloc().0);
            self.graph
                .buffers
                .insert(id.0, BufferCell::new(Buffer::new(port_type, 8)))
                .ok();
            id
        }

        fn unit(&mut self, offset: f32) -> NodeHandle {
            let id = NodeHandle(self.slots.alloc().0);
            self.graph
                .units
                .insert(id.0, RtUnit::Plugin(Box::new(AddUnit(offset))))
                .ok();
            id
        }

        fn value(&self, id: BufferId) -> f32 {
            unsafe { buffer_ref(&self.graph.buffers, id) }.unwrap().value()
        }

        fn install(&mut self, patch: CompiledPatch) {
            let root = self.graph.root;
            if let Some(RtUnit::Patch(p)) = self.graph.units.get_mut(root.0) {
                p.order = Some(Box::new(patch));
            }
        }

        fn run(&mut self) {
            let root = self.graph.root;
            self.graph.run_patch(root, &proc_info());
        }
    }

    fn proc_info() -> ProcInfo {
        ProcInfo {
            frames: 8,
            cycle_start: 0,
            sample_rate: 48_000,
            stream_status: StreamStatus::empty(),
        }
    }

    fn patch(steps: Vec<Step>, io: Vec<BufferId>) -> CompiledPatch {
        CompiledPatch {
            steps,
            io,
            order: Vec::new(),
            monitors: Vec::new(),
            silence: Vec::new(),
            audio_inputs: Vec::new(),
            audio_outputs: Vec::new(),
        }
    }

    // Two voices feeding one through a mix:
    //
    //  ┌────────┐      ┌───────┐
    //  │ a (x2) ┼─mix──► b     │
    //  └────────┘      └───────┘
    #[test]
    fn run_and_mix() {
        let mut fx = Fixture::new();

        let a_in = [fx.buffer(PortType::Control), fx.buffer(PortType::Control)];
        let a_out = [fx.buffer(PortType::Control), fx.buffer(PortType::Control)];
        let local = fx.buffer(PortType::Control);
        let b_out = fx.buffer(PortType::Control);

        let a = fx.unit(1.0);
        let b = fx.unit(10.0);

        fx.install(patch(
            vec![
                Step::Run {
                    node: a,
                    voices: 2,
                    num_inputs: 1,
                    num_outputs: 1,
                    io_offset: 0,
                },
                Step::Clear(local),
                Step::Mix {
                    dst: local,
                    src: a_out[0],
                },
                Step::Mix {
                    dst: local,
                    src: a_out[1],
                },
                Step::Run {
                    node: b,
                    voices: 1,
                    num_inputs: 1,
                    num_outputs: 1,
                    io_offset: 4,
                },
            ],
            vec![a_in[0], a_out[0], a_in[1], a_out[1], local, b_out],
        ));

        fx.run();

        // Voice 0 writes 1, voice 1 writes 2.
        assert_eq!(fx.value(a_out[0]), 1.0);
        assert_eq!(fx.value(a_out[1]), 2.0);
        assert_eq!(fx.value(local), 3.0);
        assert_eq!(fx.value(b_out), 13.0);

        // Running again clears the mix buffer first.
        fx.run();
        assert_eq!(fx.value(b_out), 13.0);
    }

    #[test]
    fn dangling_handles_are_skipped() {
        let mut fx = Fixture::new();

        let out = fx.buffer(PortType::Control);
        let dangling = fx.unit(0.0);
        fx.graph.units.remove(dangling.0);

        fx.install(patch(
            vec![
                Step::Clear(BufferId::DANGLING),
                Step::Run {
                    node: dangling,
                    voices: 1,
                    num_inputs: 0,
                    num_outputs: 1,
                    io_offset: 0,
                },
            ],
            vec![out],
        ));

        fx.run();

        assert_eq!(
            fx.graph.diagnostics.skipped_steps.load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn queue_steps_and_monitors() {
        let mut fx = Fixture::new();

        let src = fx.buffer(PortType::Control);
        let dst = fx.buffer(PortType::Control);

        let queue = QueueId(fx.slots.alloc().0);
        fx.graph
            .queues
            .insert(queue.0, TransferQueue::new(4, Arc::new(AtomicU64::new(0))))
            .ok();

        unsafe { buffer_mut(&fx.graph.buffers, src) }
            .unwrap()
            .set_value(0.75, 0);

        let monitor = Arc::new(AtomicF32::new(0.0));
        let mut compiled = patch(
            vec![
                Step::Enqueue {
                    queue,
                    srcs: IoRange { start: 0, len: 1 },
                },
                Step::Dequeue { queue, dst },
            ],
            vec![src],
        );
        compiled.monitors.push((dst, Arc::clone(&monitor)));
        fx.install(compiled);

        fx.run();

        assert_eq!(fx.value(dst), 0.75);
        assert_eq!(monitor.load(Ordering::Relaxed), 0.75);
    }

    #[test]
    fn disabled_patch_silences_outputs() {
        let mut fx = Fixture::new();

        let out = fx.buffer(PortType::Audio);
        let node = fx.unit(0.5);
        let input = fx.buffer(PortType::Audio);

        let mut compiled = patch(
            vec![Step::Run {
                node,
                voices: 1,
                num_inputs: 1,
                num_outputs: 1,
                io_offset: 0,
            }],
            vec![input, out],
        );
        compiled.silence.push(out);
        fx.install(compiled);

        fx.run();
        assert_eq!(fx.value(out), 0.5);

        let root = fx.graph.root;
        if let Some(RtUnit::Patch(p)) = fx.graph.units.get_mut(root.0) {
            p.enabled = false;
        }

        fx.run();
        assert_eq!(fx.value(out), 0.0);
    }
}
