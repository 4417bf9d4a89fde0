use std::ops::Range;

use arrayvec::ArrayVec;
use rtrb::PushError;

use patchbay_core::{
    maid::MaidHandle,
    node::{ProcInfo, StreamStatus},
    util::{deinterleave, interleave},
    Buffer, MAX_PORTS,
};

use crate::{
    context::RealtimeContext,
    engine::AudioParams,
    event::Event,
    graph::{BufferId, NodeHandle},
    rt::{buffer_mut, buffer_ref, Garbage, RtGraph},
};

/// The realtime half of the engine.
///
/// The audio driver calls [`EngineProcessor::process`] once per cycle.
/// Nothing in here allocates, frees, locks, or blocks.
pub struct EngineProcessor {
    rt: RealtimeContext,
    graph: RtGraph,

    from_control: rtrb::Consumer<Box<Event>>,
    to_post: rtrb::Producer<Box<Event>>,
    maid: MaidHandle<Garbage>,

    params: AudioParams,

    scratch_in: Vec<Vec<f32>>,
    scratch_out: Vec<Vec<f32>>,
}

impl EngineProcessor {
    pub(crate) fn new(
        graph: RtGraph,
        from_control: rtrb::Consumer<Box<Event>>,
        to_post: rtrb::Producer<Box<Event>>,
        maid: MaidHandle<Garbage>,
        params: AudioParams,
    ) -> Self {
        Self {
            rt: RealtimeContext::new(),
            graph,
            from_control,
            to_post,
            maid,
            params,
            scratch_in: Vec::new(),
            scratch_out: Vec::new(),
        }
    }

    pub fn params(&self) -> AudioParams {
        self.params
    }

    /// The handle of the root patch.
    pub fn root(&self) -> NodeHandle {
        self.graph.root
    }

    /// Process the sample times in `range`.
    ///
    /// Channel `i` of `inputs` feeds the `i`th audio input of the root
    /// patch, and the voices of the `i`th audio output of the root patch
    /// are summed into channel `i` of `outputs`. Each channel must hold
    /// at least `range.end - range.start` frames.
    ///
    /// The range is split into cycles of at most `cycle_size` frames.
    /// Before each cycle, every event due before its end is executed.
    pub fn process(
        &mut self,
        range: Range<u64>,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        stream_status: StreamStatus,
    ) {
        let root = self.graph.root;
        let mut start = range.start;

        while start < range.end {
            let frames = ((range.end - start) as usize).min(self.params.cycle_size);
            let end = start + frames as u64;
            let offset = (start - range.start) as usize;

            self.execute_events(start, end);

            self.write_inputs(inputs, offset, frames);

            self.graph.run_patch(
                root,
                &ProcInfo {
                    frames,
                    cycle_start: start,
                    sample_rate: self.params.sample_rate,
                    stream_status,
                },
            );

            self.read_outputs(outputs, offset, frames);

            start = end;
        }
    }

    /// Process interleaved buffers of audio data.
    ///
    /// `input` holds `num_in_channels` and `output` holds
    /// `num_out_channels` interleaved channels of `range.end - range.start`
    /// frames each.
    pub fn process_interleaved(
        &mut self,
        range: Range<u64>,
        input: &[f32],
        num_in_channels: usize,
        output: &mut [f32],
        num_out_channels: usize,
        stream_status: StreamStatus,
    ) {
        let frames = (range.end - range.start) as usize;

        debug_assert_eq!(input.len(), frames * num_in_channels);
        debug_assert_eq!(output.len(), frames * num_out_channels);

        let mut scratch_in = std::mem::take(&mut self.scratch_in);
        let mut scratch_out = std::mem::take(&mut self.scratch_out);

        let num_in = num_in_channels.min(scratch_in.len());
        let num_out = num_out_channels.min(scratch_out.len());

        let mut done = 0;
        while done < frames {
            let block = (frames - done).min(self.params.cycle_size);
            let start = range.start + done as u64;

            let block_in = input
                .get(done * num_in_channels..(done + block) * num_in_channels)
                .unwrap_or(&[]);
            deinterleave(
                scratch_in[..num_in].iter_mut().map(|ch| &mut ch[..block]),
                block_in,
                num_in_channels,
            );

            let inputs: ArrayVec<&[f32], MAX_PORTS> =
                scratch_in[..num_in].iter().map(|ch| &ch[..block]).collect();
            let mut outputs: ArrayVec<&mut [f32], MAX_PORTS> = scratch_out[..num_out]
                .iter_mut()
                .map(|ch| &mut ch[..block])
                .collect();

            self.process(
                start..start + block as u64,
                &inputs,
                &mut outputs,
                stream_status,
            );
            drop(outputs);

            if let Some(block_out) =
                output.get_mut(done * num_out_channels..(done + block) * num_out_channels)
            {
                interleave(
                    scratch_out[..num_out].iter().map(|ch| &ch[..block]),
                    block_out,
                    num_out_channels,
                );
            }

            done += block;
        }

        self.scratch_in = scratch_in;
        self.scratch_out = scratch_out;
    }

    /// Reserve the scratch space [`EngineProcessor::process_interleaved`]
    /// needs for the given number of channels.
    ///
    /// This allocates, so it must be called before the stream starts.
    pub fn prepare_interleaved(&mut self, num_in_channels: usize, num_out_channels: usize) {
        let cycle_size = self.params.cycle_size;
        let channels = |n: usize| vec![vec![0.0; cycle_size]; n.min(MAX_PORTS)];

        self.scratch_in = channels(num_in_channels);
        self.scratch_out = channels(num_out_channels);
    }

    /// Get a buffer by its handle.
    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        // SAFETY: Buffers are only mutated while processing, which
        // needs `&mut self`.
        unsafe { buffer_ref(&self.graph.buffers, id) }
    }

    /// The child handles of a patch in the order they are processed.
    pub fn process_order(&self, patch: NodeHandle) -> Option<&[NodeHandle]> {
        self.graph
            .patch(patch)
            .and_then(|p| p.order.as_deref())
            .map(|o| o.order())
    }

    /// Whether the patch is currently processed.
    pub fn is_enabled(&self, patch: NodeHandle) -> Option<bool> {
        self.graph.patch(patch).map(|p| p.enabled)
    }

    fn execute_events(&mut self, start: u64, end: u64) {
        loop {
            match self.from_control.peek() {
                Ok(event) if event.timestamp() < end => {}
                _ => return,
            }

            // Keep the event queued until there is room for everything
            // it hands over.
            if self.to_post.slots() == 0 || self.maid.slots() == 0 {
                return;
            }

            let Ok(mut event) = self.from_control.pop() else {
                return;
            };

            let offset = event.timestamp().saturating_sub(start) as usize;
            event.execute(&self.rt, &mut self.graph, offset);

            if let Some(retired) = event.take_retired() {
                match self.maid.push(Garbage::Retired(retired)) {
                    Ok(()) => {}
                    Err(Garbage::Retired(retired)) => event.restore_retired(retired),
                    Err(other) => std::mem::forget(other),
                }
            }

            if let Err(PushError::Full(event)) = self.to_post.push(event) {
                self.graph.diagnostics.lost_objects.fetch_add(
                    1,
                    std::sync::atomic::Ordering::Relaxed,
                );
                std::mem::forget(event);
            }
        }
    }

    fn write_inputs(&mut self, inputs: &[&[f32]], offset: usize, frames: usize) {
        let Some(order) = self
            .graph
            .patch(self.graph.root)
            .and_then(|p| p.order.as_deref())
        else {
            return;
        };

        for (i, voices) in order.audio_inputs.iter().enumerate() {
            let channel = inputs
                .get(i)
                .and_then(|ch| ch.get(offset..offset + frames));

            for &id in voices.iter() {
                // SAFETY: No other buffer reference is alive.
                let Some(b) = (unsafe { buffer_mut(&self.graph.buffers, id) }) else {
                    continue;
                };

                let samples = b.samples_mut();
                let n = frames.min(samples.len());
                match channel {
                    Some(ch) => samples[..n].copy_from_slice(&ch[..n]),
                    None => samples[..n].fill(0.0),
                }
            }
        }
    }

    fn read_outputs(&mut self, outputs: &mut [&mut [f32]], offset: usize, frames: usize) {
        let root = self.graph.patch(self.graph.root);
        let order = root
            .filter(|p| p.enabled)
            .and_then(|p| p.order.as_deref());

        for (i, channel) in outputs.iter_mut().enumerate() {
            let Some(out) = channel.get_mut(offset..offset + frames) else {
                continue;
            };
            out.fill(0.0);

            let Some(voices) = order.and_then(|o| o.audio_outputs.get(i)) else {
                continue;
            };

            for &id in voices.iter() {
                // SAFETY: Only shared references are taken here.
                if let Some(b) = unsafe { buffer_ref(&self.graph.buffers, id) } {
                    for (o, s) in out.iter_mut().zip(b.samples().iter()) {
                        *o += *s;
                    }
                }
            }
        }
    }
}

impl Drop for EngineProcessor {
    fn drop(&mut self) {
        // Make sure the graph is not deallocated in the audio thread.
        let graph = self.graph.take();
        if let Err(garbage) = self.maid.push(Garbage::Graph(graph)) {
            log::warn!("maid is full, freeing the realtime graph in place");
            drop(garbage);
        }
    }
}
