use std::sync::Arc;

use atomic_float::AtomicF32;
use smallvec::smallvec;

use patchbay_core::{node::Instance, Path, PortType, Value};

use super::{connect::reclassify, ControlState, RtOp, Stage, WatchOp};
use crate::{
    error::EngineError,
    graph::{GraphObjectKind, ObjectType, VoiceBuffers},
    notify::Notification,
    rt::RtUnit,
};

pub(super) fn set_port_value(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    value: f32,
    voice: Option<u32>,
) -> Result<(), EngineError> {
    let port = state
        .store
        .find_port_mut(&state.cx, path)
        .ok_or_else(|| EngineError::ObjectNotFound(path.clone()))?;

    if port.port_type == PortType::Event {
        return Err(EngineError::TypeMismatch(format!(
            "event port {} has no value",
            path
        )));
    }

    let buffers: VoiceBuffers = match voice {
        None => port.buffers.clone(),
        Some(v) => match port.buffers.get(v as usize) {
            Some(&id) => smallvec![id],
            None => {
                return Err(EngineError::InvalidPolyphony {
                    path: path.clone(),
                    poly: v as i64,
                })
            }
        },
    };

    port.value = value;

    for buffer in buffers {
        stage.tx.push(RtOp::SetValue { buffer, value });
    }

    Ok(())
}

pub(super) fn set_property(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    key: &str,
    value: &Value,
) -> Result<(), EngineError> {
    let object_type = state
        .store
        .find(path)
        .map(|o| o.object_type())
        .ok_or_else(|| EngineError::ObjectNotFound(path.clone()))?;

    match key {
        "enabled" => set_enabled(state, stage, path, object_type, expect_bool(key, value)?)?,
        "polyphony" => {
            let poly = value.as_int().ok_or_else(|| mismatch(key, "an int", value))?;
            set_polyphony(state, stage, path, object_type, poly)?
        }
        "polyphonic" => {
            set_polyphonic(state, stage, path, object_type, expect_bool(key, value)?)?
        }
        "broadcast" => set_broadcast(state, stage, path, object_type, expect_bool(key, value)?)?,
        "context" => {
            return Err(EngineError::TypeMismatch(String::from(
                "the context of a port can only be set when it is created",
            )))
        }
        _ => {}
    }

    if let Some(object) = state.store.find_mut(&state.cx, path) {
        if key == "polyphonic" {
            object.polyphonic = value.as_bool().unwrap_or(object.polyphonic);
        }
        object.properties.insert(key.to_string(), value.clone());
    }
    if key == "polyphonic" {
        sync_port_flags(state, path);
    }

    stage.notify(Notification::PropertyChanged {
        path: path.clone(),
        key: key.to_string(),
        value: value.clone(),
    });

    Ok(())
}

fn mismatch(key: &str, expected: &str, value: &Value) -> EngineError {
    EngineError::TypeMismatch(format!(
        "{} must be {}, got {}",
        key,
        expected,
        value.type_name()
    ))
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, EngineError> {
    value.as_bool().ok_or_else(|| mismatch(key, "a bool", value))
}

fn expect_type(
    key: &str,
    path: &Path,
    object_type: ObjectType,
    expected: ObjectType,
) -> Result<(), EngineError> {
    if object_type == expected {
        Ok(())
    } else {
        Err(EngineError::TypeMismatch(format!(
            "{} only applies to a {:?}, {} is a {:?}",
            key, expected, path, object_type
        )))
    }
}

fn set_enabled(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    object_type: ObjectType,
    enabled: bool,
) -> Result<(), EngineError> {
    expect_type("enabled", path, object_type, ObjectType::Patch)?;

    let Some(patch) = state.store.find_patch_mut(&state.cx, path) else {
        return Err(EngineError::ObjectNotFound(path.clone()));
    };
    patch.enabled = enabled;
    stage.tx.push(RtOp::SetEnabled(patch.handle, enabled));

    // The parent reads the outputs of an enabled patch from inside it,
    // and those of a disabled one from its silenced ports.
    match path.parent() {
        Some(parent) => state.recompile(stage, &parent),
        None => Ok(()),
    }
}

fn set_polyphony(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    object_type: ObjectType,
    poly: i32,
) -> Result<(), EngineError> {
    expect_type("polyphony", path, object_type, ObjectType::Patch)?;

    if poly < 1 || poly as u32 > state.config.max_polyphony {
        return Err(EngineError::InvalidPolyphony {
            path: path.clone(),
            poly: poly as i64,
        });
    }
    let poly = poly as u32;

    let Some(patch) = state.store.find_patch(path) else {
        return Err(EngineError::ObjectNotFound(path.clone()));
    };
    if patch.internal_polyphony == poly {
        return Ok(());
    }

    let mut nodes = Vec::new();
    let mut subpatches = Vec::new();
    for child in patch.nodes.iter() {
        match state.store.find(child) {
            Some(o) if o.polyphonic() && o.object_type() == ObjectType::Node => {
                nodes.push(child.clone())
            }
            Some(o) if o.polyphonic() && o.object_type() == ObjectType::Patch => {
                subpatches.push(child.clone())
            }
            _ => {}
        }
    }

    // Instantiate everything up front so that a failure leaves the
    // graph untouched.
    let mut instances = Vec::with_capacity(nodes.len());
    for node in nodes {
        let instance = reinstantiate(state, &node, poly)?;
        instances.push((node, instance));
    }

    if let Some(patch) = state.store.find_patch_mut(&state.cx, path) {
        patch.internal_polyphony = poly;
    }

    // The root has no parent to hide its voices from.
    if path.is_root() {
        set_external_polyphony(state, stage, path, poly);
    }

    for (node, instance) in instances {
        replace_node(state, stage, &node, instance, poly);
    }

    for sub in subpatches.iter() {
        set_external_polyphony(state, stage, sub, poly);
        state.compile_one(stage, sub)?;
    }

    reclassify(state, stage, path);

    state.recompile(stage, path)
}

fn set_polyphonic(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    object_type: ObjectType,
    polyphonic: bool,
) -> Result<(), EngineError> {
    let parent = match (object_type, path.parent()) {
        (ObjectType::Node | ObjectType::Patch, Some(parent)) => parent,
        _ => {
            return Err(EngineError::TypeMismatch(format!(
                "{} can't be made polyphonic",
                path
            )))
        }
    };

    let parent_poly = state
        .store
        .find_patch(&parent)
        .map(|p| p.internal_polyphony)
        .ok_or_else(|| EngineError::ParentNotFound(path.clone()))?;
    let poly = if polyphonic { parent_poly } else { 1 };

    let current = state.store.find(path).map(|o| o.polyphony()).unwrap_or(1);
    if current == poly {
        return Ok(());
    }

    match object_type {
        ObjectType::Node => {
            let instance = reinstantiate(state, path, poly)?;
            replace_node(state, stage, path, instance, poly);
            reclassify(state, stage, &parent);
            state.recompile(stage, &parent)
        }
        _ => {
            set_external_polyphony(state, stage, path, poly);
            reclassify(state, stage, &parent);
            state.recompile(stage, path)
        }
    }
}

fn set_broadcast(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    object_type: ObjectType,
    broadcast: bool,
) -> Result<(), EngineError> {
    expect_type("broadcast", path, object_type, ObjectType::Port)?;

    let Some(port) = state.store.find_port_mut(&state.cx, path) else {
        return Err(EngineError::ObjectNotFound(path.clone()));
    };

    match (broadcast, port.monitor.is_some()) {
        (true, false) => {
            let value = Arc::new(AtomicF32::new(port.value));
            port.monitor = Some(Arc::clone(&value));
            stage.watches.push(WatchOp::Port {
                path: path.clone(),
                value,
            });
        }
        (false, true) => {
            port.monitor = None;
            stage.watches.push(WatchOp::Unwatch(path.clone()));
        }
        _ => return Ok(()),
    }

    match state.scope_of(path) {
        Some(scope) => state.compile_one(stage, &scope),
        None => Ok(()),
    }
}

/// Instantiate the plugin of an existing node again with a new
/// polyphony. The new instance must have the same ports.
fn reinstantiate(state: &mut ControlState, node: &Path, poly: u32) -> Result<Instance, EngineError> {
    let plugin = state
        .store
        .find_node(node)
        .map(|n| n.plugin.clone())
        .ok_or_else(|| EngineError::ObjectNotFound(node.clone()))?;

    let instance = state.instantiate(node, &plugin, poly)?;

    if !state.same_layout(node, &instance.ports) {
        log::warn!("{} changed its ports at polyphony {}", plugin, poly);
        return Err(EngineError::InstantiationFailed {
            path: node.clone(),
            plugin,
        });
    }

    Ok(instance)
}

/// Swap in a new instance of a node along with fresh port buffers.
fn replace_node(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    instance: Instance,
    poly: u32,
) {
    let Some(node) = state.store.find_node_mut(&state.cx, path) else {
        return;
    };
    node.polyphony = poly;
    let handle = node.handle;
    let ports = node.ports.clone();

    realloc_ports(state, stage, &ports, poly);

    stage
        .tx
        .push(RtOp::InsertUnit(handle, RtUnit::Plugin(instance.unit)));
}

/// Change the number of voices a patch has in its parent, which is the
/// number of voices of its boundary ports.
fn set_external_polyphony(state: &mut ControlState, stage: &mut Stage, path: &Path, poly: u32) {
    let Some(patch) = state.store.find_patch_mut(&state.cx, path) else {
        return;
    };
    patch.polyphony = poly;
    let ports = patch.ports.clone();

    realloc_ports(state, stage, &ports, poly);
    sync_port_flags(state, path);
    reclassify(state, stage, path);
}

/// Update the polyphonic flag of the ports of a node or patch. Node
/// ports follow their node, patch ports are polyphonic while they carry
/// more than one voice.
fn sync_port_flags(state: &mut ControlState, path: &Path) {
    let Some(object) = state.store.find(path) else {
        return;
    };
    let (ports, node_flag) = match &object.kind {
        GraphObjectKind::Node(node) => (node.ports.clone(), Some(object.polyphonic)),
        GraphObjectKind::Patch(patch) => (patch.ports.clone(), None),
        GraphObjectKind::Port(_) => return,
    };

    for port_path in ports.iter() {
        if let Some(port) = state.store.find_mut(&state.cx, port_path) {
            let voices = port.as_port().map_or(1, |p| p.voices());
            port.polyphonic = node_flag.unwrap_or(voices > 1);
        }
    }
}

fn realloc_ports(state: &mut ControlState, stage: &mut Stage, ports: &[Path], voices: u32) {
    for path in ports.iter() {
        let Some(port) = state.store.find_port_mut(&state.cx, path) else {
            continue;
        };
        let old = std::mem::take(&mut port.buffers);
        let (port_type, value) = (port.port_type, port.value);

        state.free_buffers(stage, &old);
        let buffers = state.alloc_buffers(stage, port_type, voices, value);

        if let Some(port) = state.store.find_port_mut(&state.cx, path) {
            port.buffers = buffers;
        }
    }
}
