use std::sync::{atomic::AtomicU64, Arc};

use ahash::AHashMap;
use atomic_float::AtomicF32;
use smallvec::SmallVec;

use patchbay_core::{
    node::{ExecContext, PortDirection},
    Path, PortType, Properties, Value,
};

use super::{BufferId, NodeHandle, QueueId};

/// The kind of a [`GraphObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Patch,
    Node,
    Port,
}

/// A live object in the graph, identified by its path.
#[derive(Debug, Clone)]
pub struct GraphObject {
    path: Path,
    pub(crate) properties: Properties,
    pub(crate) polyphonic: bool,
    pub(crate) kind: GraphObjectKind,
}

#[derive(Debug, Clone)]
pub enum GraphObjectKind {
    Patch(PatchData),
    Node(NodeData),
    Port(PortData),
}

impl GraphObject {
    pub(crate) fn new(
        path: Path,
        properties: Properties,
        polyphonic: bool,
        kind: GraphObjectKind,
    ) -> Self {
        Self {
            path,
            properties,
            polyphonic,
            kind,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Whether this object follows the polyphony of its parent patch.
    pub fn polyphonic(&self) -> bool {
        self.polyphonic
    }

    pub fn kind(&self) -> &GraphObjectKind {
        &self.kind
    }

    pub fn object_type(&self) -> ObjectType {
        match &self.kind {
            GraphObjectKind::Patch(_) => ObjectType::Patch,
            GraphObjectKind::Node(_) => ObjectType::Node,
            GraphObjectKind::Port(_) => ObjectType::Port,
        }
    }

    pub fn as_patch(&self) -> Option<&PatchData> {
        match &self.kind {
            GraphObjectKind::Patch(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodeData> {
        match &self.kind {
            GraphObjectKind::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_port(&self) -> Option<&PortData> {
        match &self.kind {
            GraphObjectKind::Port(p) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn as_patch_mut(&mut self) -> Option<&mut PatchData> {
        match &mut self.kind {
            GraphObjectKind::Patch(p) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn as_node_mut(&mut self) -> Option<&mut NodeData> {
        match &mut self.kind {
            GraphObjectKind::Node(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn as_port_mut(&mut self) -> Option<&mut PortData> {
        match &mut self.kind {
            GraphObjectKind::Port(p) => Some(p),
            _ => None,
        }
    }

    /// The realtime handle of a patch or node.
    pub fn handle(&self) -> Option<NodeHandle> {
        match &self.kind {
            GraphObjectKind::Patch(p) => Some(p.handle),
            GraphObjectKind::Node(n) => Some(n.handle),
            GraphObjectKind::Port(_) => None,
        }
    }

    /// The ports of a patch or node, in index order.
    pub fn ports(&self) -> &[Path] {
        match &self.kind {
            GraphObjectKind::Patch(p) => &p.ports,
            GraphObjectKind::Node(n) => &n.ports,
            GraphObjectKind::Port(_) => &[],
        }
    }

    /// The polyphony of a patch or node as seen from its parent.
    pub fn polyphony(&self) -> u32 {
        match &self.kind {
            GraphObjectKind::Patch(p) => p.polyphony,
            GraphObjectKind::Node(n) => n.polyphony,
            GraphObjectKind::Port(p) => p.voices() as u32,
        }
    }
}

/// A container of nodes, boundary ports and the connections between them.
#[derive(Debug, Clone)]
pub struct PatchData {
    pub(crate) handle: NodeHandle,
    /// The polyphony of this patch inside its parent.
    pub(crate) polyphony: u32,
    /// The polyphony polyphonic children of this patch run with.
    pub(crate) internal_polyphony: u32,
    pub(crate) enabled: bool,
    /// Direct children in insertion order.
    pub(crate) nodes: Vec<Path>,
    /// Boundary ports in index order.
    pub(crate) ports: Vec<Path>,
    pub(crate) connections: Vec<Connection>,
    pub(crate) next_port_index: u32,
    /// The order of the process order installed last.
    pub(crate) process_order: Option<Vec<Path>>,
    /// The per-voice buffers each port in this patch's scope resolves to.
    pub(crate) bindings: AHashMap<Path, SmallVec<[BufferId; 4]>>,
}

impl PatchData {
    pub(crate) fn new(handle: NodeHandle, polyphony: u32, internal_polyphony: u32) -> Self {
        Self {
            handle,
            polyphony,
            internal_polyphony,
            enabled: true,
            nodes: Vec::new(),
            ports: Vec::new(),
            connections: Vec::new(),
            next_port_index: 0,
            process_order: None,
            bindings: AHashMap::default(),
        }
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn polyphony(&self) -> u32 {
        self.polyphony
    }

    pub fn internal_polyphony(&self) -> u32 {
        self.internal_polyphony
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn nodes(&self) -> &[Path] {
        &self.nodes
    }

    pub fn ports(&self) -> &[Path] {
        &self.ports
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, src: &Path, dst: &Path) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| &c.src == src && &c.dst == dst)
    }

    /// The compiled process order, or `None` if none has been installed.
    pub fn process_order(&self) -> Option<&[Path]> {
        self.process_order.as_deref()
    }
}

/// An instantiated plugin.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub(crate) handle: NodeHandle,
    pub(crate) plugin: String,
    pub(crate) polyphony: u32,
    /// Ports in index order.
    pub(crate) ports: Vec<Path>,
}

impl NodeData {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn polyphony(&self) -> u32 {
        self.polyphony
    }

    pub fn ports(&self) -> &[Path] {
        &self.ports
    }
}

/// An input or output of a node or patch.
#[derive(Debug, Clone)]
pub struct PortData {
    pub(crate) index: u32,
    pub(crate) direction: PortDirection,
    pub(crate) port_type: PortType,
    pub(crate) context: ExecContext,
    /// One buffer per voice.
    pub(crate) buffers: SmallVec<[BufferId; 4]>,
    /// The last value set on this port.
    pub(crate) value: f32,
    /// Set while the port value is broadcast.
    pub(crate) monitor: Option<Arc<AtomicF32>>,
}

impl PortData {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    pub fn context(&self) -> ExecContext {
        self.context
    }

    pub fn voices(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn is_broadcast(&self) -> bool {
        self.monitor.is_some()
    }
}

/// A connection from a source port to a destination port.
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) src: Path,
    pub(crate) dst: Path,
    pub(crate) must_mix: bool,
    pub(crate) must_queue: bool,
    /// The private buffer the destination reads when mixing or queueing.
    pub(crate) local: Option<BufferId>,
    pub(crate) queue: Option<QueueId>,
    /// Samples dropped by a full transfer queue.
    pub(crate) dropped: Option<Arc<AtomicU64>>,
}

impl Connection {
    pub fn src(&self) -> &Path {
        &self.src
    }

    pub fn dst(&self) -> &Path {
        &self.dst
    }

    /// The source has more voices than the destination, so the source
    /// voices are summed into a private buffer.
    pub fn must_mix(&self) -> bool {
        self.must_mix
    }

    /// The ports run in different execution contexts, so data moves
    /// through a transfer queue.
    pub fn must_queue(&self) -> bool {
        self.must_queue
    }

    pub fn local_buffer(&self) -> Option<BufferId> {
        self.local
    }

    /// Whether the connection touches a port owned by `owner`.
    pub(crate) fn touches_owner(&self, owner: &Path) -> bool {
        self.src.parent().as_ref() == Some(owner) || self.dst.parent().as_ref() == Some(owner)
    }

    pub(crate) fn touches_port(&self, port: &Path) -> bool {
        &self.src == port || &self.dst == port
    }
}
