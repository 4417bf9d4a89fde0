//! Commands and the three-phase events that carry them.
//!
//! An [`Event`] is pre-processed in the control context, where all of
//! the validation and allocation happens and the changes to the
//! realtime graph are staged in a [`Transaction`]. The realtime context
//! then executes the event, which only moves the staged values into
//! place. Finally the event is post-processed in the reclamation
//! context, which replies to the submitter and broadcasts what changed.

mod connect;
mod create;
mod remove;
mod set;
mod staging;

use std::sync::{atomic::AtomicU64, Arc};

use atomic_float::AtomicF32;

use patchbay_core::{node::PortDirection, Path, PortType, Properties, Value};

pub(crate) use staging::{ControlState, RtOp, Stage, Transaction};

use crate::{
    context::RealtimeContext,
    error::EngineError,
    graph::GraphObject,
    notify::{EventId, Notification, NotificationSink, Responder},
    rt::{Retired, RtGraph},
};

/// A request to change the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create a patch with the given internal polyphony.
    CreatePatch {
        path: Path,
        polyphony: u32,
        properties: Properties,
    },
    /// Instantiate a plugin as a node.
    CreateNode {
        path: Path,
        plugin: String,
        polyphonic: bool,
        properties: Properties,
    },
    /// Add a boundary port to a patch.
    CreatePort {
        path: Path,
        port_type: PortType,
        direction: PortDirection,
        properties: Properties,
    },
    Connect {
        src: Path,
        dst: Path,
    },
    Disconnect {
        src: Path,
        dst: Path,
    },
    /// Remove every connection touching a port, or any port of a node
    /// or patch.
    DisconnectAll {
        path: Path,
    },
    /// Set the value of every voice of a port, or of a single voice.
    SetPortValue {
        path: Path,
        value: f32,
        voice: Option<u32>,
    },
    SetProperty {
        path: Path,
        key: String,
        value: Value,
    },
    /// Destroy an object and everything below it.
    Destroy {
        path: Path,
    },
    /// Destroy every child node of a patch and all of its connections.
    ClearPatch {
        path: Path,
    },
}

impl Command {
    pub fn create_patch(path: Path, polyphony: u32) -> Self {
        Self::CreatePatch {
            path,
            polyphony,
            properties: Properties::new(),
        }
    }

    pub fn create_node(path: Path, plugin: &str, polyphonic: bool) -> Self {
        Self::CreateNode {
            path,
            plugin: plugin.to_string(),
            polyphonic,
            properties: Properties::new(),
        }
    }

    pub fn create_port(path: Path, port_type: PortType, direction: PortDirection) -> Self {
        Self::CreatePort {
            path,
            port_type,
            direction,
            properties: Properties::new(),
        }
    }

    pub fn connect(src: Path, dst: Path) -> Self {
        Self::Connect { src, dst }
    }

    pub fn disconnect(src: Path, dst: Path) -> Self {
        Self::Disconnect { src, dst }
    }

    pub fn set_port_value(path: Path, value: f32) -> Self {
        Self::SetPortValue {
            path,
            value,
            voice: None,
        }
    }

    pub fn set_property(path: Path, key: &str, value: impl Into<Value>) -> Self {
        Self::SetProperty {
            path,
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn destroy(path: Path) -> Self {
        Self::Destroy { path }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreatePatch { .. } => "create_patch",
            Self::CreateNode { .. } => "create_node",
            Self::CreatePort { .. } => "create_port",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::DisconnectAll { .. } => "disconnect_all",
            Self::SetPortValue { .. } => "set_port_value",
            Self::SetProperty { .. } => "set_property",
            Self::Destroy { .. } => "destroy",
            Self::ClearPatch { .. } => "clear_patch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    PreProcessed,
    Executed,
    PostProcessed,
}

/// A change to the values the post-processor watches.
pub(crate) enum WatchOp {
    Port {
        path: Path,
        value: Arc<AtomicF32>,
    },
    Unwatch(Path),
    Queue {
        src: Path,
        dst: Path,
        dropped: Arc<AtomicU64>,
    },
    UnwatchQueue {
        src: Path,
        dst: Path,
    },
    /// Stop watching everything at or below a path.
    UnwatchUnder(Path),
}

pub(crate) struct Event {
    id: EventId,
    timestamp: u64,
    command: Command,
    responder: Box<dyn Responder>,
    phase: Phase,
    error: Option<EngineError>,
    transaction: Transaction,
    notifications: Vec<Notification>,
    watches: Vec<WatchOp>,
    /// Objects removed from the store, dropped once the event is done.
    removed: Vec<GraphObject>,
}

impl Event {
    pub fn new(
        id: EventId,
        timestamp: u64,
        command: Command,
        responder: Box<dyn Responder>,
    ) -> Self {
        Self {
            id,
            timestamp,
            command,
            responder,
            phase: Phase::Created,
            error: None,
            transaction: Transaction::default(),
            notifications: Vec::new(),
            watches: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    /// Validate the command and stage its changes.
    ///
    /// A failure is stored on the event. The event still flows through
    /// the other two phases so that it gets a reply.
    pub fn pre_process(&mut self, state: &mut ControlState) {
        debug_assert_eq!(self.phase, Phase::Created);

        let mut stage = Stage::default();

        // Setting a value validates everything before it changes anything.
        let checkpoint = (!matches!(self.command, Command::SetPortValue { .. }))
            .then(|| state.checkpoint());

        let result = match &self.command {
            Command::CreatePatch {
                path,
                polyphony,
                properties,
            } => create::create_patch(state, &mut stage, path, *polyphony, properties),
            Command::CreateNode {
                path,
                plugin,
                polyphonic,
                properties,
            } => create::create_node(state, &mut stage, path, plugin, *polyphonic, properties),
            Command::CreatePort {
                path,
                port_type,
                direction,
                properties,
            } => create::create_port(state, &mut stage, path, *port_type, *direction, properties),
            Command::Connect { src, dst } => connect::connect(state, &mut stage, src, dst),
            Command::Disconnect { src, dst } => connect::disconnect(state, &mut stage, src, dst),
            Command::DisconnectAll { path } => connect::disconnect_all(state, &mut stage, path),
            Command::SetPortValue { path, value, voice } => {
                set::set_port_value(state, &mut stage, path, *value, *voice)
            }
            Command::SetProperty { path, key, value } => {
                set::set_property(state, &mut stage, path, key, value)
            }
            Command::Destroy { path } => remove::destroy(state, &mut stage, path),
            Command::ClearPatch { path } => remove::clear_patch(state, &mut stage, path),
        };

        match result {
            Ok(()) => {
                log::debug!(
                    "pre-processed {} ({:?}): {} realtime ops",
                    self.command.name(),
                    self.id,
                    stage.tx.len()
                );

                let Stage {
                    mut tx,
                    notifications,
                    watches,
                    removed,
                } = stage;

                tx.seal();
                self.transaction = tx;
                self.notifications = notifications;
                self.watches = watches;
                self.removed = removed;
            }
            Err(e) => {
                log::warn!("{} ({:?}) failed: {}", self.command.name(), self.id, e);

                if let Some(checkpoint) = checkpoint {
                    state.rollback(checkpoint);
                }
                self.error = Some(e);
            }
        }

        self.phase = Phase::PreProcessed;
    }

    /// Apply the staged changes to the realtime graph.
    ///
    /// `offset` is the frame within the current cycle the event lands
    /// on. This never allocates or frees.
    pub fn execute(&mut self, _rt: &RealtimeContext, graph: &mut RtGraph, offset: usize) {
        debug_assert_eq!(self.phase, Phase::PreProcessed);

        if self.error.is_none() {
            self.transaction.apply(graph, offset);
        }

        self.phase = Phase::Executed;
    }

    /// Take the objects displaced by [`Event::execute`], if there are any.
    pub fn take_retired(&mut self) -> Option<Box<Retired>> {
        self.transaction.take_retired()
    }

    /// Put retired objects back so they are freed with the event.
    pub fn restore_retired(&mut self, retired: Box<Retired>) {
        self.transaction.restore_retired(retired);
    }

    /// Reply to the submitter and broadcast the changes.
    ///
    /// Returns the watch changes for the post-processor to apply.
    pub fn post_process(&mut self, sink: &mut dyn NotificationSink) -> Vec<WatchOp> {
        debug_assert_eq!(self.phase, Phase::Executed);

        let result = match self.error.take() {
            Some(e) => Err(e),
            None => {
                for n in self.notifications.drain(..) {
                    sink.notify(n);
                }
                Ok(())
            }
        };

        self.responder.respond(self.id, result);
        self.removed.clear();
        self.phase = Phase::PostProcessed;

        std::mem::take(&mut self.watches)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Every submitted event is answered, also when the engine shuts
        // down with the event still queued in one of its halves.
        if self.phase != Phase::PostProcessed {
            log::debug!("{} event {:?} cancelled", self.command.name(), self.id);
            self.responder.respond(self.id, Err(EngineError::Cancelled));
        }
    }
}
