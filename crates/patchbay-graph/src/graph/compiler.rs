use ahash::AHashMap;
use smallvec::SmallVec;
use std::{cmp::Reverse, collections::BinaryHeap};

use patchbay_core::{node::PortDirection, Path, PortType};

use super::{BufferId, Connection, GraphObjectKind, GraphObjectStore, NodeHandle, PatchData, PortData};
use crate::error::EngineError;

mod schedule;

pub use schedule::{CompiledPatch, IoRange, Step};

/// Per-voice buffers of a port.
pub(crate) type VoiceBuffers = SmallVec<[BufferId; 4]>;

/// The result of compiling one patch.
#[derive(Debug)]
pub(crate) struct CompiledOutput {
    pub schedule: CompiledPatch,
    /// The direct children in process order.
    pub order: Vec<Path>,
    /// The buffers every port in the patch's scope resolves to.
    pub bindings: AHashMap<Path, VoiceBuffers>,
}

/// Main compilation algorithm
pub(crate) fn compile_patch(
    store: &GraphObjectStore,
    path: &Path,
) -> Result<CompiledOutput, EngineError> {
    let patch = store
        .find_patch(path)
        .ok_or_else(|| EngineError::ObjectNotFound(path.clone()))?;

    let ir = PatchIR::preprocess(patch);
    let sorted = ir
        .sort_topologically()
        .ok_or_else(|| EngineError::InternalError(format!("cycle detected in {}", path)))?;

    let order: Vec<Path> = sorted.into_iter().map(|i| ir.nodes[i].clone()).collect();

    let mut builder = ScheduleBuilder::new(store, path, patch);
    builder.build(&order)?;

    Ok(builder.finish(order))
}

/// Whether a connection from a port of `src_owner` to a port of
/// `dst_owner` inside `patch` would create a cycle.
///
/// Connections to and from the boundary of `patch` never do.
pub(crate) fn creates_cycle(
    store: &GraphObjectStore,
    patch: &Path,
    src_owner: &Path,
    dst_owner: &Path,
) -> bool {
    if src_owner == patch || dst_owner == patch {
        return false;
    }

    if src_owner == dst_owner {
        return true;
    }

    let Some(patch) = store.find_patch(patch) else {
        return false;
    };

    let mut ir = PatchIR::preprocess(patch);
    ir.add_edge(src_owner, dst_owner);

    ir.sort_topologically().is_none()
}

/// Find the patch a connection between two ports belongs to.
///
/// Both ports must be owned by the patch itself or one of its direct
/// children. Returns `None` if no such patch exists.
pub(crate) fn connection_patch(store: &GraphObjectStore, src: &Path, dst: &Path) -> Option<Path> {
    let src_owner = src.parent()?;
    let dst_owner = dst.parent()?;
    let src_port = store.find_port(src)?;

    let patch = if src_owner == dst_owner {
        // A patch input wired straight through to one of its outputs.
        if store.find_patch(&src_owner).is_some() && src_port.direction == PortDirection::Input {
            src_owner
        } else {
            src_owner.parent()?
        }
    } else if src_owner.parent().is_some() && src_owner.parent() == dst_owner.parent() {
        src_owner.parent()?
    } else if dst_owner.parent().as_ref() == Some(&src_owner) {
        src_owner
    } else if src_owner.parent().as_ref() == Some(&dst_owner) {
        dst_owner
    } else {
        return None;
    };

    store.find_patch(&patch).map(|_| patch)
}

/// Whether data can flow from `src` to `dst` inside `patch`.
///
/// Inside a patch, its boundary inputs are sources and its boundary
/// outputs are sinks, the opposite of how its parent sees them.
pub(crate) fn valid_endpoints(
    patch: &Path,
    src: &Path,
    src_port: &PortData,
    dst: &Path,
    dst_port: &PortData,
) -> bool {
    let src_is_boundary = src.parent().as_ref() == Some(patch);
    let dst_is_boundary = dst.parent().as_ref() == Some(patch);

    let src_ok = match src_port.direction {
        PortDirection::Input => src_is_boundary,
        PortDirection::Output => !src_is_boundary,
    };
    let dst_ok = match dst_port.direction {
        PortDirection::Input => !dst_is_boundary,
        PortDirection::Output => dst_is_boundary,
    };

    src_ok && dst_ok
}

/// Internal IR used by the compiler algorithm: the dependency graph
/// between the direct children of one patch.
struct PatchIR {
    /// The children in insertion order.
    nodes: Vec<Path>,
    lookup: AHashMap<Path, usize>,
    outgoing: Vec<SmallVec<[usize; 4]>>,
}

impl PatchIR {
    /// Build the adjacency table from the connections of the patch.
    ///
    /// Queued connections are left out, since they never make the
    /// destination wait for the source within a cycle.
    fn preprocess(patch: &PatchData) -> Self {
        let lookup = patch
            .nodes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();

        let mut ir = Self {
            nodes: patch.nodes.clone(),
            lookup,
            outgoing: vec![SmallVec::new(); patch.nodes.len()],
        };

        for c in patch.connections.iter().filter(|c| !c.must_queue) {
            if let (Some(src), Some(dst)) = (c.src.parent(), c.dst.parent()) {
                ir.add_edge(&src, &dst);
            }
        }

        ir
    }

    fn add_edge(&mut self, src_owner: &Path, dst_owner: &Path) {
        let (Some(&src), Some(&dst)) = (self.lookup.get(src_owner), self.lookup.get(dst_owner))
        else {
            return;
        };

        if src != dst && !self.outgoing[src].contains(&dst) {
            self.outgoing[src].push(dst);
        }
    }

    /// Sort the nodes topologically using Kahn's algorithm.
    ///
    /// Among the nodes that are ready, the one inserted first is always
    /// picked, so the result only depends on the insertion order.
    /// Returns `None` if there is a cycle.
    fn sort_topologically(&self) -> Option<Vec<usize>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for outgoing in self.outgoing.iter() {
            for &dst in outgoing.iter() {
                in_degree[dst] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);

            for &dst in self.outgoing[i].iter() {
                in_degree[dst] -= 1;
                if in_degree[dst] == 0 {
                    ready.push(Reverse(dst));
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }
}

fn voice_buffer(buffers: &[BufferId], voice: usize) -> Option<BufferId> {
    if buffers.is_empty() {
        return None;
    }

    buffers.get(voice % buffers.len()).copied()
}

struct ScheduleBuilder<'a> {
    store: &'a GraphObjectStore,
    path: &'a Path,
    patch: &'a PatchData,
    steps: Vec<Step>,
    io: Vec<BufferId>,
    handles: Vec<NodeHandle>,
    bindings: AHashMap<Path, VoiceBuffers>,
}

impl<'a> ScheduleBuilder<'a> {
    fn new(store: &'a GraphObjectStore, path: &'a Path, patch: &'a PatchData) -> Self {
        Self {
            store,
            path,
            patch,
            steps: Vec::new(),
            io: Vec::new(),
            handles: Vec::with_capacity(patch.nodes.len()),
            bindings: AHashMap::default(),
        }
    }

    fn port(&self, path: &Path) -> Result<&'a PortData, EngineError> {
        self.store
            .find_port(path)
            .ok_or_else(|| EngineError::InternalError(format!("missing port {}", path)))
    }

    /// The buffers holding the data produced at a source port.
    ///
    /// Outputs of an enabled child patch are read straight from whatever
    /// that patch resolved them to.
    fn source_buffers(&self, path: &Path) -> Result<VoiceBuffers, EngineError> {
        let port = self.port(path)?;

        if port.direction == PortDirection::Output {
            let child = path
                .parent()
                .filter(|owner| owner != self.path)
                .and_then(|owner| self.store.find_patch(&owner));

            if let Some(child) = child.filter(|c| c.enabled) {
                if let Some(resolved) = child.bindings.get(path) {
                    if resolved.len() == port.buffers.len() {
                        return Ok(resolved.clone());
                    }
                }
            }
        }

        Ok(port.buffers.clone())
    }

    /// The buffer voice `voice` of the destination reads through `c`.
    fn connection_buffer(&self, c: &Connection, voice: usize) -> Result<BufferId, EngineError> {
        if let Some(local) = c.local {
            return Ok(local);
        }

        let src = self.source_buffers(&c.src)?;
        voice_buffer(&src, voice)
            .ok_or_else(|| EngineError::InternalError(format!("{} has no buffers", c.src)))
    }

    /// Emit the steps that fill the private buffer of a mixed or queued
    /// connection.
    fn fill_local(&mut self, c: &Connection) -> Result<(), EngineError> {
        let Some(local) = c.local else {
            return Ok(());
        };

        if let (true, Some(queue)) = (c.must_queue, c.queue) {
            self.steps.push(Step::Dequeue { queue, dst: local });
            return Ok(());
        }

        self.steps.push(Step::Clear(local));
        for src in self.source_buffers(&c.src)? {
            self.steps.push(Step::Mix { dst: local, src });
        }

        Ok(())
    }

    fn enqueue(&mut self, c: &Connection) -> Result<(), EngineError> {
        let (true, Some(queue)) = (c.must_queue, c.queue) else {
            return Ok(());
        };

        let srcs = self.source_buffers(&c.src)?;
        let start = self.io.len() as u32;
        self.io.extend_from_slice(&srcs);

        self.steps.push(Step::Enqueue {
            queue,
            srcs: IoRange {
                start,
                len: srcs.len() as u32,
            },
        });

        Ok(())
    }

    /// Work out which buffers a destination port reads from.
    ///
    /// A port with a single incoming connection reads the connection's
    /// buffer directly. Otherwise the connections are summed into the
    /// port's own buffers, which is also always done when `own` is set.
    fn resolve_input(&mut self, path: &Path, own: bool) -> Result<VoiceBuffers, EngineError> {
        let port = self.port(path)?;
        let patch = self.patch;

        let incoming: SmallVec<[&Connection; 4]> =
            patch.connections.iter().filter(|c| &c.dst == path).collect();

        if incoming.is_empty() {
            return Ok(port.buffers.clone());
        }

        if incoming.len() == 1 && !own {
            return (0..port.buffers.len())
                .map(|v| self.connection_buffer(incoming[0], v))
                .collect();
        }

        for (voice, &dst) in port.buffers.iter().enumerate() {
            self.steps.push(Step::Clear(dst));

            for c in incoming.iter() {
                let src = self.connection_buffer(c, voice)?;
                if src != dst {
                    self.steps.push(Step::Mix { dst, src });
                }
            }
        }

        Ok(port.buffers.clone())
    }

    fn build(&mut self, order: &[Path]) -> Result<(), EngineError> {
        let patch = self.patch;

        // Boundary inputs are written by the parent before this patch runs.
        for path in patch.ports.iter() {
            let port = self.port(path)?;
            if port.direction == PortDirection::Input {
                self.bindings.insert(path.clone(), port.buffers.clone());

                for c in patch.connections.iter().filter(|c| &c.src == path) {
                    self.enqueue(c)?;
                }
            }
        }

        for child in order.iter() {
            for c in patch
                .connections
                .iter()
                .filter(|c| c.dst.parent().as_ref() == Some(child))
            {
                self.fill_local(c)?;
            }

            let object = self
                .store
                .find(child)
                .ok_or_else(|| EngineError::InternalError(format!("missing child {}", child)))?;

            match object.kind() {
                GraphObjectKind::Node(node) => {
                    let mut inputs: SmallVec<[VoiceBuffers; 8]> = SmallVec::new();
                    let mut outputs: SmallVec<[VoiceBuffers; 8]> = SmallVec::new();

                    for path in node.ports.iter() {
                        let port = self.port(path)?;
                        match port.direction {
                            PortDirection::Input => {
                                let resolved = self.resolve_input(path, false)?;
                                self.bindings.insert(path.clone(), resolved.clone());
                                inputs.push(resolved);
                            }
                            PortDirection::Output => {
                                self.bindings.insert(path.clone(), port.buffers.clone());
                                outputs.push(port.buffers.clone());
                            }
                        }
                    }

                    let io_offset = self.io.len() as u32;
                    for voice in 0..node.polyphony as usize {
                        for buffers in inputs.iter().chain(outputs.iter()) {
                            let id = voice_buffer(buffers, voice).ok_or_else(|| {
                                EngineError::InternalError(format!("{} has an empty port", child))
                            })?;
                            self.io.push(id);
                        }
                    }

                    self.steps.push(Step::Run {
                        node: node.handle,
                        voices: node.polyphony,
                        num_inputs: inputs.len() as u32,
                        num_outputs: outputs.len() as u32,
                        io_offset,
                    });
                    self.handles.push(node.handle);
                }
                GraphObjectKind::Patch(sub) => {
                    for path in sub.ports.iter() {
                        if self.port(path)?.direction == PortDirection::Input {
                            let resolved = self.resolve_input(path, true)?;
                            self.bindings.insert(path.clone(), resolved);
                        }
                    }

                    self.steps.push(Step::RunPatch(sub.handle));
                    self.handles.push(sub.handle);

                    for path in sub.ports.iter() {
                        if self.port(path)?.direction == PortDirection::Output {
                            let resolved = self.source_buffers(path)?;
                            self.bindings.insert(path.clone(), resolved);
                        }
                    }
                }
                GraphObjectKind::Port(_) => {
                    return Err(EngineError::InternalError(format!(
                        "{} is listed as a child of {}",
                        child, self.path
                    )));
                }
            }

            for c in patch
                .connections
                .iter()
                .filter(|c| c.src.parent().as_ref() == Some(child))
            {
                self.enqueue(c)?;
            }
        }

        for c in patch
            .connections
            .iter()
            .filter(|c| c.dst.parent().as_ref() == Some(self.path))
        {
            self.fill_local(c)?;
        }

        for path in patch.ports.iter() {
            if self.port(path)?.direction == PortDirection::Output {
                let resolved = self.resolve_input(path, false)?;
                self.bindings.insert(path.clone(), resolved);
            }
        }

        Ok(())
    }

    fn finish(self, order: Vec<Path>) -> CompiledOutput {
        let mut monitors = Vec::new();
        let mut silence = Vec::new();
        let mut audio_inputs = Vec::new();
        let mut audio_outputs = Vec::new();

        // Ports of child patches are monitored by the child itself.
        let node_ports = self
            .patch
            .nodes
            .iter()
            .filter_map(|p| self.store.find_node(p))
            .flat_map(|n| n.ports.iter());

        for path in self.patch.ports.iter().chain(node_ports) {
            let (Some(port), Some(resolved)) = (self.store.find_port(path), self.bindings.get(path))
            else {
                continue;
            };

            if let (Some(monitor), Some(&id)) = (&port.monitor, resolved.first()) {
                monitors.push((id, std::sync::Arc::clone(monitor)));
            }
        }

        for path in self.patch.ports.iter() {
            let Some(port) = self.store.find_port(path) else {
                continue;
            };

            match port.direction {
                PortDirection::Input => {
                    if port.port_type == PortType::Audio {
                        audio_inputs.push(port.buffers.clone());
                    }
                }
                PortDirection::Output => {
                    silence.extend_from_slice(&port.buffers);

                    if port.port_type == PortType::Audio {
                        audio_outputs.push(
                            self.bindings
                                .get(path)
                                .cloned()
                                .unwrap_or_else(|| port.buffers.clone()),
                        );
                    }
                }
            }
        }

        CompiledOutput {
            schedule: CompiledPatch {
                steps: self.steps,
                io: self.io,
                order: self.handles,
                monitors,
                silence,
                audio_inputs,
                audio_outputs,
            },
            order,
            bindings: self.bindings,
        }
    }
}

#[cfg(test)]
mod tests {
    use patchbay_core::{node::ExecContext, slab::SlotAllocator};

    use super::*;
    use crate::{context::ControlContext, graph::GraphObject, graph::NodeData};

    struct Fixture {
        cx: ControlContext,
        store: GraphObjectStore,
        slots: SlotAllocator,
    }

    fn p(s: &str) -> Path {
        Path::new(s).unwrap()
    }

    impl Fixture {
        fn new() -> Self {
            let mut fx = Self {
                cx: ControlContext::new(),
                store: GraphObjectStore::new(),
                slots: SlotAllocator::new(64),
            };
            fx.patch("/", 1);
            fx
        }

        fn handle(&mut self) -> NodeHandle {
            NodeHandle(self.slots.alloc().0)
        }

        fn buffers(&mut self, voices: u32) -> VoiceBuffers {
            (0..voices).map(|_| BufferId(self.slots.alloc().0)).collect()
        }

        fn patch(&mut self, path: &str, poly: u32) {
            let handle = self.handle();
            self.store
                .add(
                    &self.cx,
                    GraphObject::new(
                        p(path),
                        Default::default(),
                        false,
                        GraphObjectKind::Patch(PatchData::new(handle, poly, poly)),
                    ),
                )
                .unwrap();

            if let Some(parent) = p(path).parent() {
                self.store
                    .find_patch_mut(&self.cx, &parent)
                    .unwrap()
                    .nodes
                    .push(p(path));
            }
        }

        fn port(&mut self, path: &str, direction: PortDirection, voices: u32) {
            let index = self.store.find(&p(path).parent().unwrap()).unwrap().ports().len() as u32;
            let buffers = self.buffers(voices);
            self.store
                .add(
                    &self.cx,
                    GraphObject::new(
                        p(path),
                        Default::default(),
                        false,
                        GraphObjectKind::Port(PortData {
                            index,
                            direction,
                            port_type: PortType::Audio,
                            context: ExecContext::Audio,
                            buffers,
                            value: 0.0,
                            monitor: None,
                        }),
                    ),
                )
                .unwrap();

            let owner = self.store.find_mut(&self.cx, &p(path).parent().unwrap()).unwrap();
            match &mut owner.kind {
                GraphObjectKind::Patch(patch) => patch.ports.push(p(path)),
                GraphObjectKind::Node(node) => node.ports.push(p(path)),
                GraphObjectKind::Port(_) => unreachable!(),
            }
        }

        /// A node with an `in` and an `out` port.
        fn node(&mut self, path: &str, voices: u32) {
            let handle = self.handle();
            self.store
                .add(
                    &self.cx,
                    GraphObject::new(
                        p(path),
                        Default::default(),
                        voices > 1,
                        GraphObjectKind::Node(NodeData {
                            handle,
                            plugin: String::from("test"),
                            polyphony: voices,
                            ports: Vec::new(),
                        }),
                    ),
                )
                .unwrap();

            self.store
                .find_patch_mut(&self.cx, &p(path).parent().unwrap())
                .unwrap()
                .nodes
                .push(p(path));

            self.port(&format!("{}/in", path), PortDirection::Input, voices);
            self.port(&format!("{}/out", path), PortDirection::Output, voices);
        }

        fn connect(&mut self, src: &str, dst: &str) {
            let (src, dst) = (p(src), p(dst));
            let patch = connection_patch(&self.store, &src, &dst).unwrap();

            let src_voices = self.store.find_port(&src).unwrap().voices();
            let dst_voices = self.store.find_port(&dst).unwrap().voices();
            let must_mix = src_voices > dst_voices;
            let local = must_mix.then(|| BufferId(self.slots.alloc().0));

            self.store
                .find_patch_mut(&self.cx, &patch)
                .unwrap()
                .connections
                .push(Connection {
                    src,
                    dst,
                    must_mix,
                    must_queue: false,
                    local,
                    queue: None,
                    dropped: None,
                });
        }

        fn compile(&self, patch: &str) -> CompiledOutput {
            compile_patch(&self.store, &p(patch)).unwrap()
        }

        fn buffers_of(&self, port: &str) -> VoiceBuffers {
            self.store.find_port(&p(port)).unwrap().buffers.clone()
        }

        fn handle_of(&self, path: &str) -> NodeHandle {
            self.store.find(&p(path)).unwrap().handle().unwrap()
        }
    }

    fn names(order: &[Path]) -> Vec<&str> {
        order.iter().map(|p| p.name()).collect()
    }

    /// Every connection between two children must go from an earlier
    /// child to a later one.
    fn verify_order(fx: &Fixture, patch: &str, order: &[Path]) {
        let patch = fx.store.find_patch(&p(patch)).unwrap();
        assert_eq!(order.len(), patch.nodes.len());

        for c in patch.connections.iter() {
            let src = order.iter().position(|n| Some(n) == c.src.parent().as_ref());
            let dst = order.iter().position(|n| Some(n) == c.dst.parent().as_ref());
            if let (Some(src), Some(dst)) = (src, dst) {
                assert!(src < dst, "{} must run before {}", c.src, c.dst);
            }
        }
    }

    // Compile test 1:
    //
    //        ┌───┐  ┌───┐
    //   ┌────► b ┼──►   │
    // ┌─┼─┐  └───┘  │ d ┼──┐
    // │ a │  ┌───┐  │   │  │  ┌───┐
    // └─┬─┘  │ c ┼──►   │  └──► e │
    //   └────►   │  └───┘     └───┘
    //        └───┘
    //
    // Inserted in the order e, d, c, b, a.
    #[test]
    fn compile_test_1() {
        let mut fx = Fixture::new();

        for name in ["e", "d", "c", "b", "a"] {
            fx.node(&format!("/{}", name), 1);
        }

        fx.connect("/a/out", "/b/in");
        fx.connect("/a/out", "/c/in");
        fx.connect("/b/out", "/d/in");
        fx.connect("/c/out", "/d/in");
        fx.connect("/d/out", "/e/in");

        let out = fx.compile("/");

        verify_order(&fx, "/", &out.order);
        // c was inserted before b.
        assert_eq!(names(&out.order), vec!["a", "c", "b", "d", "e"]);
        assert_eq!(out.schedule.order.len(), 5);
        assert_eq!(out.schedule.order[0], fx.handle_of("/a"));
    }

    #[test]
    fn unconnected_nodes_keep_insertion_order() {
        let mut fx = Fixture::new();

        for name in ["z", "y", "x"] {
            fx.node(&format!("/{}", name), 1);
        }

        let out = fx.compile("/");
        assert_eq!(names(&out.order), vec!["z", "y", "x"]);
    }

    #[test]
    fn single_connection_is_zero_copy() {
        let mut fx = Fixture::new();

        fx.node("/a", 1);
        fx.node("/b", 1);
        fx.connect("/a/out", "/b/in");

        let out = fx.compile("/");

        assert_eq!(out.bindings[&p("/b/in")], fx.buffers_of("/a/out"));
        assert!(!out
            .schedule
            .steps
            .iter()
            .any(|s| matches!(s, Step::Clear(_) | Step::Mix { .. })));

        // b reads a's output buffer as its input.
        let b_in = fx.buffers_of("/a/out")[0];
        let b_out = fx.buffers_of("/b/out")[0];
        assert!(out.schedule.io.ends_with(&[b_in, b_out]));
    }

    #[test]
    fn fan_in_is_summed_into_own_buffer() {
        let mut fx = Fixture::new();

        fx.node("/a", 1);
        fx.node("/b", 1);
        fx.node("/c", 1);
        fx.connect("/a/out", "/c/in");
        fx.connect("/b/out", "/c/in");

        let out = fx.compile("/");

        let own = fx.buffers_of("/c/in")[0];
        assert_eq!(out.bindings[&p("/c/in")][0], own);

        let a = fx.buffers_of("/a/out")[0];
        let b = fx.buffers_of("/b/out")[0];
        let steps = &out.schedule.steps;
        let clear = steps.iter().position(|s| *s == Step::Clear(own)).unwrap();
        let mix_a = steps.iter().position(|s| *s == Step::Mix { dst: own, src: a }).unwrap();
        let mix_b = steps.iter().position(|s| *s == Step::Mix { dst: own, src: b }).unwrap();
        assert!(clear < mix_a && clear < mix_b);
    }

    // Four voices summed into one:
    //
    //  ┌──────────┐      ┌─────┐
    //  │ osc (x4) ┼─mix──► out │
    //  └──────────┘      └─────┘
    #[test]
    fn polyphonic_source_is_mixed() {
        let mut fx = Fixture::new();

        fx.node("/osc", 4);
        fx.node("/sink", 1);
        fx.connect("/osc/out", "/sink/in");

        let out = fx.compile("/");

        let c = fx
            .store
            .find_patch(&Path::root())
            .unwrap()
            .connection(&p("/osc/out"), &p("/sink/in"))
            .unwrap();
        let local = c.local.unwrap();

        assert!(c.must_mix);
        assert_eq!(out.bindings[&p("/sink/in")][0], local);

        let mixes = out
            .schedule
            .steps
            .iter()
            .filter(|s| matches!(s, Step::Mix { dst, .. } if *dst == local))
            .count();
        assert_eq!(mixes, 4);
    }

    #[test]
    fn cycle_detection() {
        let mut fx = Fixture::new();

        fx.node("/a", 1);
        fx.node("/b", 1);
        fx.node("/c", 1);
        fx.connect("/a/out", "/b/in");
        fx.connect("/b/out", "/c/in");

        let root = Path::root();
        assert!(creates_cycle(&fx.store, &root, &p("/c"), &p("/a")));
        assert!(creates_cycle(&fx.store, &root, &p("/a"), &p("/a")));
        assert!(!creates_cycle(&fx.store, &root, &p("/a"), &p("/c")));
        // The boundary of the patch never closes a cycle.
        assert!(!creates_cycle(&fx.store, &root, &p("/c"), &root));
    }

    #[test]
    fn connection_patches() {
        let mut fx = Fixture::new();

        fx.patch("/main", 1);
        fx.port("/main/in", PortDirection::Input, 1);
        fx.port("/main/out", PortDirection::Output, 1);
        fx.node("/main/osc", 1);
        fx.node("/top", 1);

        let cp = |src: &str, dst: &str| connection_patch(&fx.store, &p(src), &p(dst));

        assert_eq!(cp("/main/osc/out", "/main/out"), Some(p("/main")));
        assert_eq!(cp("/main/in", "/main/osc/in"), Some(p("/main")));
        assert_eq!(cp("/main/in", "/main/out"), Some(p("/main")));
        assert_eq!(cp("/main/out", "/top/in"), Some(Path::root()));
        assert_eq!(cp("/top/out", "/main/in"), Some(Path::root()));
        assert_eq!(cp("/main/osc/out", "/main/osc/in"), Some(p("/main")));
        assert_eq!(cp("/main/osc/out", "/top/in"), None);
    }

    #[test]
    fn endpoint_directions() {
        let mut fx = Fixture::new();

        fx.patch("/main", 1);
        fx.port("/main/in", PortDirection::Input, 1);
        fx.port("/main/out", PortDirection::Output, 1);
        fx.node("/main/osc", 1);

        let main = p("/main");
        let check = |src: &str, dst: &str| {
            valid_endpoints(
                &main,
                &p(src),
                fx.store.find_port(&p(src)).unwrap(),
                &p(dst),
                fx.store.find_port(&p(dst)).unwrap(),
            )
        };

        assert!(check("/main/osc/out", "/main/out"));
        assert!(check("/main/in", "/main/osc/in"));
        assert!(check("/main/in", "/main/out"));
        assert!(!check("/main/osc/in", "/main/out"));
        assert!(!check("/main/out", "/main/osc/in"));
    }

    // A sub-patch output resolves to the node feeding it:
    //
    //  ┌ /main ─────────────┐
    //  │  ┌─────┐           │    ┌──────┐
    //  │  │ osc ┼───► out ──┼────► sink │
    //  │  └─────┘           │    └──────┘
    //  └────────────────────┘
    #[test]
    fn subpatch_outputs_resolve_through() {
        let mut fx = Fixture::new();

        fx.patch("/main", 1);
        fx.node("/main/osc", 1);
        fx.port("/main/out", PortDirection::Output, 1);
        fx.node("/sink", 1);

        fx.connect("/main/osc/out", "/main/out");
        fx.connect("/main/out", "/sink/in");

        let inner = fx.compile("/main");
        assert_eq!(names(&inner.order), vec!["osc"]);
        assert_eq!(inner.bindings[&p("/main/out")], fx.buffers_of("/main/osc/out"));
        assert_eq!(inner.schedule.silence, fx.buffers_of("/main/out").to_vec());

        fx.store
            .find_patch_mut(&fx.cx, &p("/main"))
            .unwrap()
            .bindings = inner.bindings;

        let outer = fx.compile("/");
        assert_eq!(names(&outer.order), vec!["main", "sink"]);
        assert_eq!(outer.bindings[&p("/sink/in")], fx.buffers_of("/main/osc/out"));
        assert_eq!(outer.schedule.steps[0], Step::RunPatch(fx.handle_of("/main")));

        // A disabled sub-patch is read through its own, silenced, buffers.
        fx.store.find_patch_mut(&fx.cx, &p("/main")).unwrap().enabled = false;
        let outer = fx.compile("/");
        assert_eq!(outer.bindings[&p("/sink/in")], fx.buffers_of("/main/out"));
    }
}
