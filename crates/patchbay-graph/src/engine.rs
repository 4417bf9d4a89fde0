use std::collections::VecDeque;
use std::sync::Arc;

use rtrb::PushError;

use patchbay_core::{maid::maid, node::PluginHost, BufferFactory, Path, DEFAULT_CYCLE_SIZE};

use crate::{
    error::EngineError,
    event::{Command, ControlState, Event},
    graph::{BufferId, GraphObject, GraphObjectStore, NodeData, PatchData, PortData},
    notify::{EventId, Responder},
    post::PostProcessor,
    processor::EngineProcessor,
    rt::{Garbage, RtDiagnostics},
};

/// The configuration of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// The polyphony of the root patch.
    ///
    /// By default this is set to `1`.
    pub root_polyphony: u32,

    /// The maximum polyphony any patch may have.
    ///
    /// By default this is set to `128`.
    pub max_polyphony: u32,

    /// The number of pre-processed events that can wait for the
    /// realtime thread, and the number of executed events that can wait
    /// for the post-processor.
    ///
    /// By default this is set to `256`.
    pub event_queue_capacity: usize,

    /// The number of retired objects that can wait for the
    /// post-processor to free them.
    ///
    /// By default this is set to `256`.
    pub maid_capacity: usize,

    /// The initial capacity of the realtime node and patch slab.
    ///
    /// By default this is set to `64`.
    pub initial_node_capacity: usize,

    /// The initial capacity of the realtime buffer slab.
    ///
    /// By default this is set to `512`.
    pub initial_buffer_capacity: usize,

    /// The initial capacity of the realtime transfer queue slab.
    ///
    /// By default this is set to `16`.
    pub initial_queue_capacity: usize,

    /// The maximum number of events an event buffer holds per cycle.
    ///
    /// By default this is set to `256`.
    pub event_buffer_capacity: usize,

    /// How many cycles of samples a transfer queue between execution
    /// contexts can hold.
    ///
    /// By default this is set to `4`.
    pub queue_cycles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_polyphony: 1,
            max_polyphony: 128,
            event_queue_capacity: 256,
            maid_capacity: 256,
            initial_node_capacity: 64,
            initial_buffer_capacity: 512,
            initial_queue_capacity: 16,
            event_buffer_capacity: 256,
            queue_cycles: 4,
        }
    }
}

/// The parameters of the audio stream the engine runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    /// The maximum number of frames in one cycle.
    pub cycle_size: usize,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            cycle_size: DEFAULT_CYCLE_SIZE,
        }
    }
}

/// The control half of the engine.
///
/// Commands submitted here are pre-processed on [`Engine::update`] and
/// then handed to the [`EngineProcessor`].
///
/// The queries reflect every event that has been pre-processed, which
/// may be ahead of what the realtime thread has executed so far.
pub struct Engine {
    state: ControlState,

    to_rt: rtrb::Producer<Box<Event>>,

    /// Submitted events waiting to be pre-processed.
    pending: VecDeque<Box<Event>>,
    /// Pre-processed events that did not fit into the realtime queue.
    ready: VecDeque<Box<Event>>,

    next_id: u64,
    last_timestamp: u64,
}

impl Engine {
    /// Create an engine along with its realtime and reclamation halves.
    ///
    /// The engine starts out with an empty root patch at `/`.
    pub fn new(
        config: EngineConfig,
        params: AudioParams,
        host: impl PluginHost,
    ) -> Result<(Self, EngineProcessor, PostProcessor), EngineError> {
        let params = AudioParams {
            sample_rate: params.sample_rate,
            cycle_size: params.cycle_size.max(1),
        };

        let factory = BufferFactory::default();
        let diagnostics = Arc::new(RtDiagnostics::default());

        let (state, graph) = ControlState::new(
            config,
            params,
            Box::new(host),
            factory.clone(),
            Arc::clone(&diagnostics),
        )?;

        let (to_rt, from_control) =
            rtrb::RingBuffer::<Box<Event>>::new(config.event_queue_capacity.max(1));
        let (to_post, from_rt) =
            rtrb::RingBuffer::<Box<Event>>::new(config.event_queue_capacity.max(1));
        let (maid_handle, maid) = maid::<Garbage>(config.maid_capacity.max(1));

        let processor = EngineProcessor::new(graph, from_control, to_post, maid_handle, params);
        let post = PostProcessor::new(from_rt, maid, factory, diagnostics);

        log::debug!(
            "created engine: {} Hz, {} frames per cycle",
            params.sample_rate,
            params.cycle_size
        );

        Ok((
            Self {
                state,
                to_rt,
                pending: VecDeque::new(),
                ready: VecDeque::new(),
                next_id: 0,
                last_timestamp: 0,
            },
            processor,
            post,
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    pub fn params(&self) -> AudioParams {
        self.state.params
    }

    /// Submit a command to run at the given sample time.
    ///
    /// Timestamps are clamped so that they never decrease, which makes
    /// the order of submission the order of execution. The `responder`
    /// is called with the returned id once the event is done.
    pub fn submit(
        &mut self,
        command: Command,
        timestamp: u64,
        responder: impl Responder,
    ) -> EventId {
        let timestamp = timestamp.max(self.last_timestamp);
        self.last_timestamp = timestamp;

        let id = EventId(self.next_id);
        self.next_id += 1;

        self.pending.push_back(Box::new(Event::new(
            id,
            timestamp,
            command,
            Box::new(responder),
        )));

        id
    }

    /// Pre-process submitted events and hand them to the realtime thread.
    ///
    /// This must be called regularly. Returns the number of events that
    /// were handed over.
    pub fn update(&mut self) -> usize {
        let mut sent = 0;

        while let Some(event) = self.ready.pop_front() {
            match self.to_rt.push(event) {
                Ok(()) => sent += 1,
                Err(PushError::Full(event)) => {
                    self.ready.push_front(event);
                    return sent;
                }
            }
        }

        while let Some(mut event) = self.pending.pop_front() {
            event.pre_process(&mut self.state);

            if let Err(PushError::Full(event)) = self.to_rt.push(event) {
                log::warn!(
                    "realtime event queue is full, {} events are waiting",
                    self.pending.len() + 1
                );
                self.ready.push_back(event);
                break;
            }

            sent += 1;
        }

        sent
    }

    /// The number of submitted events that have not been handed to the
    /// realtime thread yet.
    pub fn num_waiting(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    pub fn store(&self) -> &GraphObjectStore {
        &self.state.store
    }

    pub fn find_object(&self, path: &Path) -> Option<&GraphObject> {
        self.state.store.find(path)
    }

    pub fn find_patch(&self, path: &Path) -> Option<&PatchData> {
        self.state.store.find_patch(path)
    }

    pub fn find_node(&self, path: &Path) -> Option<&NodeData> {
        self.state.store.find_node(path)
    }

    pub fn find_port(&self, path: &Path) -> Option<&PortData> {
        self.state.store.find_port(path)
    }

    /// The compiled process order of a patch.
    pub fn process_order(&self, patch: &Path) -> Option<&[Path]> {
        self.state.store.find_patch(patch)?.process_order()
    }

    /// The buffers a port owns, one per voice.
    pub fn port_buffers(&self, port: &Path) -> Option<&[BufferId]> {
        self.state.store.find_port(port).map(|p| p.buffers())
    }

    /// The buffers a port reads from or writes to while processing,
    /// one per voice.
    ///
    /// An input with a single connection reads the buffers of its
    /// source, so these may differ from [`Engine::port_buffers`].
    pub fn resolved_buffers(&self, port: &Path) -> Option<&[BufferId]> {
        let scope = self.state.scope_of(port)?;
        self.state
            .store
            .find_patch(&scope)?
            .bindings
            .get(port)
            .map(|b| b.as_slice())
    }
}
