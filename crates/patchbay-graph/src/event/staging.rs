use std::sync::{atomic::AtomicU64, Arc};

use patchbay_core::{
    node::{Instance, InstantiateInfo, PluginHost, PortSpec},
    slab::{SlabStorage, SlotAllocator},
    BufferFactory, Path, PortType, MAX_PORTS,
};

use super::WatchOp;
use crate::{
    context::ControlContext,
    engine::{AudioParams, EngineConfig},
    error::EngineError,
    graph::{
        compile_patch, BufferId, CompiledPatch, Connection, GraphObject, GraphObjectKind,
        GraphObjectStore, NodeHandle, QueueId, VoiceBuffers,
    },
    notify::Notification,
    rt::{
        buffer_mut, retire, BufferCell, Retired, RtDiagnostics, RtGraph, RtUnit, TransferQueue,
    },
};

/// A single change to the realtime graph.
///
/// Applying an op only moves values around. Whatever it displaces is
/// retired.
pub(crate) enum RtOp {
    GrowUnits(SlabStorage<RtUnit>),
    GrowBuffers(SlabStorage<BufferCell>),
    GrowQueues(SlabStorage<TransferQueue>),
    RemoveUnit(NodeHandle),
    RemoveBuffer(BufferId),
    RemoveQueue(QueueId),
    InsertUnit(NodeHandle, RtUnit),
    InsertBuffer(BufferId, BufferCell),
    InsertQueue(QueueId, TransferQueue),
    InstallOrder(NodeHandle, Box<CompiledPatch>),
    SetEnabled(NodeHandle, bool),
    SetValue { buffer: BufferId, value: f32 },
}

impl RtOp {
    /// Slabs grow before anything is inserted, and slots are vacated
    /// before they are reused.
    fn rank(&self) -> u8 {
        match self {
            Self::GrowUnits(_) | Self::GrowBuffers(_) | Self::GrowQueues(_) => 0,
            Self::RemoveUnit(_) | Self::RemoveBuffer(_) | Self::RemoveQueue(_) => 1,
            Self::InsertUnit(..) | Self::InsertBuffer(..) | Self::InsertQueue(..) => 2,
            Self::InstallOrder(..) => 3,
            Self::SetEnabled(..) | Self::SetValue { .. } => 4,
        }
    }
}

/// The changes one event makes to the realtime graph.
#[derive(Default)]
pub(crate) struct Transaction {
    ops: Vec<RtOp>,
    retired: Option<Box<Retired>>,
}

impl Transaction {
    pub fn push(&mut self, op: RtOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Order the ops and reserve room for everything they may displace.
    pub fn seal(&mut self) {
        self.ops.sort_by_key(RtOp::rank);

        let mut units = 0;
        let mut buffers = 0;
        let mut queues = 0;
        let mut orders = 0;
        let mut unit_storage = 0;
        let mut buffer_storage = 0;
        let mut queue_storage = 0;

        for op in self.ops.iter() {
            match op {
                RtOp::GrowUnits(_) => unit_storage += 1,
                RtOp::GrowBuffers(_) => buffer_storage += 1,
                RtOp::GrowQueues(_) => queue_storage += 1,
                RtOp::RemoveUnit(_) | RtOp::InsertUnit(..) => units += 1,
                RtOp::RemoveBuffer(_) | RtOp::InsertBuffer(..) => buffers += 1,
                RtOp::RemoveQueue(_) | RtOp::InsertQueue(..) => queues += 1,
                RtOp::InstallOrder(..) => orders += 1,
                RtOp::SetEnabled(..) | RtOp::SetValue { .. } => {}
            }
        }

        if units + buffers + queues + orders + unit_storage + buffer_storage + queue_storage == 0 {
            return;
        }

        self.retired = Some(Box::new(Retired {
            units: Vec::with_capacity(units),
            buffers: Vec::with_capacity(buffers),
            queues: Vec::with_capacity(queues),
            orders: Vec::with_capacity(orders),
            unit_storage: Vec::with_capacity(unit_storage),
            buffer_storage: Vec::with_capacity(buffer_storage),
            queue_storage: Vec::with_capacity(queue_storage),
        }));
    }

    /// Apply every op to the realtime graph.
    ///
    /// Must be sealed first. This never allocates or frees.
    pub fn apply(&mut self, graph: &mut RtGraph, offset: usize) {
        let mut empty = Retired::default();
        let retired = match self.retired.as_deref_mut() {
            Some(r) => r,
            None => &mut empty,
        };

        let mut leaked = 0;

        for op in self.ops.drain(..) {
            let ok = match op {
                RtOp::GrowUnits(storage) => {
                    retire(&mut retired.unit_storage, graph.units.grow(storage))
                }
                RtOp::GrowBuffers(storage) => {
                    retire(&mut retired.buffer_storage, graph.buffers.grow(storage))
                }
                RtOp::GrowQueues(storage) => {
                    retire(&mut retired.queue_storage, graph.queues.grow(storage))
                }
                RtOp::RemoveUnit(h) => match graph.units.remove(h.0) {
                    Some(unit) => retire(&mut retired.units, unit),
                    None => true,
                },
                RtOp::RemoveBuffer(id) => match graph.buffers.remove(id.0) {
                    Some(b) => retire(&mut retired.buffers, b),
                    None => true,
                },
                RtOp::RemoveQueue(id) => match graph.queues.remove(id.0) {
                    Some(q) => retire(&mut retired.queues, q),
                    None => true,
                },
                RtOp::InsertUnit(h, unit) => match graph.units.insert(h.0, unit) {
                    Ok(None) => true,
                    Ok(Some(old)) | Err(old) => retire(&mut retired.units, old),
                },
                RtOp::InsertBuffer(id, b) => match graph.buffers.insert(id.0, b) {
                    Ok(None) => true,
                    Ok(Some(old)) | Err(old) => retire(&mut retired.buffers, old),
                },
                RtOp::InsertQueue(id, q) => match graph.queues.insert(id.0, q) {
                    Ok(None) => true,
                    Ok(Some(old)) | Err(old) => retire(&mut retired.queues, old),
                },
                RtOp::InstallOrder(h, order) => match graph.units.get_mut(h.0) {
                    Some(RtUnit::Patch(patch)) => match patch.order.replace(order) {
                        Some(old) => retire(&mut retired.orders, old),
                        None => true,
                    },
                    _ => retire(&mut retired.orders, order),
                },
                RtOp::SetEnabled(h, enabled) => {
                    if let Some(RtUnit::Patch(patch)) = graph.units.get_mut(h.0) {
                        patch.enabled = enabled;
                    }
                    true
                }
                RtOp::SetValue { buffer, value } => {
                    // SAFETY: No buffer reference is alive while events
                    // are executed.
                    if let Some(b) = unsafe { buffer_mut(&graph.buffers, buffer) } {
                        b.set_value(value, offset);
                    }
                    true
                }
            };

            if !ok {
                leaked += 1;
            }
        }

        if leaked > 0 {
            graph
                .diagnostics
                .lost_objects
                .fetch_add(leaked, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn take_retired(&mut self) -> Option<Box<Retired>> {
        if self.retired.as_ref().is_some_and(|r| !r.is_empty()) {
            self.retired.take()
        } else {
            None
        }
    }

    pub fn restore_retired(&mut self, retired: Box<Retired>) {
        self.retired = Some(retired);
    }
}

/// Everything a command stages while it is pre-processed.
#[derive(Default)]
pub(crate) struct Stage {
    pub tx: Transaction,
    pub notifications: Vec<Notification>,
    pub watches: Vec<WatchOp>,
    pub removed: Vec<GraphObject>,
}

impl Stage {
    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }
}

/// The control-side bookkeeping a failed command is rolled back to.
///
/// The handle allocators are part of it, since the realtime slab
/// growth they requested is dropped with the failed transaction.
pub(crate) struct Checkpoint {
    store: GraphObjectStore,
    units: SlotAllocator,
    buffers: SlotAllocator,
    queues: SlotAllocator,
}

/// The state owned by the control context.
pub(crate) struct ControlState {
    pub cx: ControlContext,
    pub store: GraphObjectStore,
    pub host: Box<dyn PluginHost>,
    pub factory: BufferFactory,
    pub config: EngineConfig,
    pub params: AudioParams,
    units: SlotAllocator,
    buffers: SlotAllocator,
    queues: SlotAllocator,
}

impl ControlState {
    /// Build the control state together with the realtime graph it
    /// mirrors. Both start out with an empty root patch.
    pub fn new(
        config: EngineConfig,
        params: AudioParams,
        host: Box<dyn PluginHost>,
        factory: BufferFactory,
        diagnostics: Arc<RtDiagnostics>,
    ) -> Result<(Self, RtGraph), EngineError> {
        let mut units = SlotAllocator::new(config.initial_node_capacity.max(1));
        let (root_idx, _) = units.alloc();
        let root = NodeHandle(root_idx);

        let mut graph = RtGraph::new(
            units.rt_capacity(),
            config.initial_buffer_capacity.max(1),
            config.initial_queue_capacity.max(1),
            root,
            diagnostics,
        );

        let mut state = Self {
            cx: ControlContext::new(),
            store: GraphObjectStore::new(),
            host,
            factory,
            params,
            buffers: SlotAllocator::new(config.initial_buffer_capacity.max(1)),
            queues: SlotAllocator::new(config.initial_queue_capacity.max(1)),
            units,
            config,
        };

        let poly = state.config.root_polyphony.clamp(1, state.config.max_polyphony.max(1));
        state.store.add(
            &state.cx,
            GraphObject::new(
                Path::root(),
                Default::default(),
                false,
                GraphObjectKind::Patch(crate::graph::PatchData::new(root, poly, poly)),
            ),
        )?;

        let compiled = compile_patch(&state.store, &Path::root())?;
        if let Some(patch) = state.store.find_patch_mut(&state.cx, &Path::root()) {
            patch.process_order = Some(compiled.order);
            patch.bindings = compiled.bindings;
        }

        let _ = graph.units.insert(
            root.0,
            RtUnit::Patch(crate::rt::RtPatch {
                enabled: true,
                order: Some(Box::new(compiled.schedule)),
            }),
        );

        Ok((state, graph))
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            store: self.store.clone(),
            units: self.units.clone(),
            buffers: self.buffers.clone(),
            queues: self.queues.clone(),
        }
    }

    /// Undo everything done since `checkpoint` was taken.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            store,
            units,
            buffers,
            queues,
        } = checkpoint;

        self.store = store;
        self.units = units;
        self.buffers = buffers;
        self.queues = queues;
    }

    /// The size of a buffer for a port of the given type.
    pub fn buffer_size(&self, port_type: PortType) -> usize {
        match port_type {
            PortType::Control => 1,
            PortType::Audio => self.params.cycle_size,
            PortType::Event => self.config.event_buffer_capacity,
        }
    }

    pub fn alloc_unit(&mut self, stage: &mut Stage) -> NodeHandle {
        let (idx, grow) = self.units.alloc();
        if let Some(capacity) = grow {
            stage.tx.push(RtOp::GrowUnits(SlabStorage::new(capacity)));
        }
        NodeHandle(idx)
    }

    pub fn free_unit(&mut self, stage: &mut Stage, handle: NodeHandle) {
        self.units.free(handle.0);
        stage.tx.push(RtOp::RemoveUnit(handle));
    }

    fn alloc_buffer(&mut self, stage: &mut Stage, port_type: PortType, value: f32) -> BufferId {
        let (idx, grow) = self.buffers.alloc();
        if let Some(capacity) = grow {
            stage.tx.push(RtOp::GrowBuffers(SlabStorage::new(capacity)));
        }

        let mut buffer = self
            .factory
            .allocate(port_type, self.buffer_size(port_type));
        buffer.set_value(value, 0);

        let id = BufferId(idx);
        stage.tx.push(RtOp::InsertBuffer(id, BufferCell::new(buffer)));
        id
    }

    /// Allocate one buffer per voice, each set to `value`.
    pub fn alloc_buffers(
        &mut self,
        stage: &mut Stage,
        port_type: PortType,
        voices: u32,
        value: f32,
    ) -> VoiceBuffers {
        (0..voices.max(1))
            .map(|_| self.alloc_buffer(stage, port_type, value))
            .collect()
    }

    pub fn free_buffers(&mut self, stage: &mut Stage, buffers: &[BufferId]) {
        for id in buffers.iter() {
            self.buffers.free(id.0);
            stage.tx.push(RtOp::RemoveBuffer(*id));
        }
    }

    fn alloc_queue(&mut self, stage: &mut Stage) -> (QueueId, Arc<AtomicU64>) {
        let (idx, grow) = self.queues.alloc();
        if let Some(capacity) = grow {
            stage.tx.push(RtOp::GrowQueues(SlabStorage::new(capacity)));
        }

        let dropped = Arc::new(AtomicU64::new(0));
        let capacity = self.params.cycle_size * self.config.queue_cycles.max(1);

        let id = QueueId(idx);
        stage.tx.push(RtOp::InsertQueue(
            id,
            TransferQueue::new(capacity, Arc::clone(&dropped)),
        ));
        (id, dropped)
    }

    /// Allocate the private buffer (and transfer queue) a mixed or
    /// queued connection needs.
    pub fn attach_connection_storage(
        &mut self,
        stage: &mut Stage,
        connection: &mut Connection,
        port_type: PortType,
    ) {
        if !connection.must_mix && !connection.must_queue {
            return;
        }

        connection.local = Some(self.alloc_buffer(stage, port_type, 0.0));

        if connection.must_queue {
            let (queue, dropped) = self.alloc_queue(stage);
            connection.queue = Some(queue);
            connection.dropped = Some(Arc::clone(&dropped));
            stage.watches.push(WatchOp::Queue {
                src: connection.src.clone(),
                dst: connection.dst.clone(),
                dropped,
            });
        }
    }

    /// Free the private storage of a connection.
    pub fn release_connection(&mut self, stage: &mut Stage, connection: &mut Connection) {
        if let Some(local) = connection.local.take() {
            self.free_buffers(stage, &[local]);
        }

        if let Some(queue) = connection.queue.take() {
            self.queues.free(queue.0);
            stage.tx.push(RtOp::RemoveQueue(queue));
            stage.watches.push(WatchOp::UnwatchQueue {
                src: connection.src.clone(),
                dst: connection.dst.clone(),
            });
        }

        connection.dropped = None;
    }

    /// Free everything the realtime graph holds for an object that was
    /// removed from the store.
    pub fn release_object(&mut self, stage: &mut Stage, object: &mut GraphObject) {
        match &mut object.kind {
            GraphObjectKind::Patch(patch) => {
                self.free_unit(stage, patch.handle);
                for c in patch.connections.iter_mut() {
                    self.release_connection(stage, c);
                }
            }
            GraphObjectKind::Node(node) => self.free_unit(stage, node.handle),
            GraphObjectKind::Port(port) => {
                let buffers = std::mem::take(&mut port.buffers);
                self.free_buffers(stage, &buffers);
            }
        }
    }

    /// Instantiate a plugin and check that its port layout is usable.
    pub fn instantiate(
        &mut self,
        path: &Path,
        plugin: &str,
        polyphony: u32,
    ) -> Result<Instance, EngineError> {
        let failed = || EngineError::InstantiationFailed {
            path: path.clone(),
            plugin: plugin.to_string(),
        };

        let instance = self
            .host
            .instantiate(&InstantiateInfo {
                plugin,
                path,
                polyphony,
                sample_rate: self.params.sample_rate,
                cycle_size: self.params.cycle_size,
            })
            .ok_or_else(failed)?;

        let num_inputs = instance
            .ports
            .iter()
            .filter(|p| p.direction == patchbay_core::node::PortDirection::Input)
            .count();
        let num_outputs = instance.ports.len() - num_inputs;

        if num_inputs > MAX_PORTS || num_outputs > MAX_PORTS {
            log::warn!("{} has too many ports", plugin);
            return Err(failed());
        }

        for (i, spec) in instance.ports.iter().enumerate() {
            let duplicate = instance.ports[..i].iter().any(|p| p.symbol == spec.symbol);
            if duplicate || path.child(&spec.symbol).is_err() {
                log::warn!("{} has an invalid port symbol {:?}", plugin, spec.symbol);
                return Err(failed());
            }
        }

        Ok(instance)
    }

    /// Whether `ports` matches the port layout of an existing node.
    pub fn same_layout(&self, node: &Path, ports: &[PortSpec]) -> bool {
        let Some(existing) = self.store.find_node(node) else {
            return false;
        };

        existing.ports.len() == ports.len()
            && existing
                .ports
                .iter()
                .zip(ports.iter())
                .all(|(path, spec)| path.name() == spec.symbol)
    }

    /// Compile a single patch and stage the new process order.
    pub fn compile_one(&mut self, stage: &mut Stage, path: &Path) -> Result<(), EngineError> {
        let compiled = compile_patch(&self.store, path)?;

        log::debug!("compiled {}: {:?}", path, compiled.order);

        let patch = self
            .store
            .find_patch_mut(&self.cx, path)
            .ok_or_else(|| EngineError::ObjectNotFound(path.clone()))?;

        patch.process_order = Some(compiled.order);
        patch.bindings = compiled.bindings;

        stage
            .tx
            .push(RtOp::InstallOrder(patch.handle, Box::new(compiled.schedule)));

        Ok(())
    }

    /// Compile a patch and every patch above it.
    ///
    /// A parent reads the outputs of a child patch through the child's
    /// own resolution, so it is compiled again as well.
    pub fn recompile(&mut self, stage: &mut Stage, path: &Path) -> Result<(), EngineError> {
        let mut next = Some(path.clone());
        while let Some(path) = next {
            self.compile_one(stage, &path)?;
            next = path.parent();
        }

        Ok(())
    }

    /// The patch whose compiled bindings include `port`.
    pub fn scope_of(&self, port: &Path) -> Option<Path> {
        let owner = port.parent()?;
        if self.store.find_patch(&owner).is_some() {
            Some(owner)
        } else {
            owner.parent()
        }
    }
}
