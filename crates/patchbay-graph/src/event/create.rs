use patchbay_core::{
    node::{ExecContext, PortDirection},
    Path, PortType, Properties, Value,
};

use super::{ControlState, RtOp, Stage};
use crate::{
    error::EngineError,
    graph::{GraphObject, GraphObjectKind, NodeData, ObjectType, PatchData, PortData},
    notify::Notification,
    rt::{RtPatch, RtUnit},
};

/// Check that nothing lives at `path` yet and return the patch that
/// will own it.
fn vacant_in_patch(state: &ControlState, path: &Path) -> Result<Path, EngineError> {
    if state.store.contains(path) {
        return Err(EngineError::ObjectExists(path.clone()));
    }

    let parent = path
        .parent()
        .ok_or_else(|| EngineError::ObjectExists(path.clone()))?;

    if state.store.find_patch(&parent).is_none() {
        return Err(EngineError::ParentNotFound(path.clone()));
    }

    Ok(parent)
}

pub(super) fn create_patch(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    polyphony: u32,
    properties: &Properties,
) -> Result<(), EngineError> {
    let parent = vacant_in_patch(state, path)?;

    if polyphony < 1 || polyphony > state.config.max_polyphony {
        return Err(EngineError::InvalidPolyphony {
            path: path.clone(),
            poly: polyphony as i64,
        });
    }

    let enabled = match properties.get("enabled") {
        Some(v) => v.as_bool().ok_or_else(|| {
            EngineError::TypeMismatch(format!("enabled must be a bool, got {}", v.type_name()))
        })?,
        None => true,
    };

    // A patch is only polyphonic in its parent if it runs with exactly
    // the parent's voices.
    let parent_poly = state
        .store
        .find_patch(&parent)
        .map(|p| p.internal_polyphony)
        .unwrap_or(1);
    let polyphonic = polyphony > 1 && polyphony == parent_poly;
    let external = if polyphonic { polyphony } else { 1 };

    let handle = state.alloc_unit(stage);

    let mut data = PatchData::new(handle, external, polyphony);
    data.enabled = enabled;

    state.store.add(
        &state.cx,
        GraphObject::new(
            path.clone(),
            properties.clone(),
            polyphonic,
            GraphObjectKind::Patch(data),
        ),
    )?;

    if let Some(parent) = state.store.find_patch_mut(&state.cx, &parent) {
        parent.nodes.push(path.clone());
    }

    stage.tx.push(RtOp::InsertUnit(
        handle,
        RtUnit::Patch(RtPatch {
            enabled,
            order: None,
        }),
    ));

    state.recompile(stage, path)?;

    stage.notify(Notification::ObjectCreated {
        path: path.clone(),
        object_type: ObjectType::Patch,
    });

    Ok(())
}

pub(super) fn create_node(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    plugin: &str,
    polyphonic: bool,
    properties: &Properties,
) -> Result<(), EngineError> {
    let parent = vacant_in_patch(state, path)?;

    let polyphony = if polyphonic {
        state
            .store
            .find_patch(&parent)
            .map(|p| p.internal_polyphony)
            .unwrap_or(1)
    } else {
        1
    };

    let instance = state.instantiate(path, plugin, polyphony)?;
    let handle = state.alloc_unit(stage);

    let mut ports = Vec::with_capacity(instance.ports.len());
    let mut created = Vec::with_capacity(instance.ports.len());

    for (index, spec) in instance.ports.iter().enumerate() {
        let port_path = path
            .child(&spec.symbol)
            .map_err(|e| EngineError::InternalError(e.to_string()))?;

        let buffers =
            state.alloc_buffers(stage, spec.port_type, polyphony, spec.default_value);

        created.push(GraphObject::new(
            port_path.clone(),
            Properties::new(),
            polyphonic,
            GraphObjectKind::Port(PortData {
                index: index as u32,
                direction: spec.direction,
                port_type: spec.port_type,
                context: spec.context,
                buffers,
                value: spec.default_value,
                monitor: None,
            }),
        ));
        ports.push(port_path);
    }

    state.store.add(
        &state.cx,
        GraphObject::new(
            path.clone(),
            properties.clone(),
            polyphonic,
            GraphObjectKind::Node(NodeData {
                handle,
                plugin: plugin.to_string(),
                polyphony,
                ports: ports.clone(),
            }),
        ),
    )?;

    stage.notify(Notification::ObjectCreated {
        path: path.clone(),
        object_type: ObjectType::Node,
    });

    for object in created {
        stage.notify(Notification::ObjectCreated {
            path: object.path().clone(),
            object_type: ObjectType::Port,
        });
        state.store.add(&state.cx, object)?;
    }

    if let Some(parent) = state.store.find_patch_mut(&state.cx, &parent) {
        parent.nodes.push(path.clone());
    }

    stage
        .tx
        .push(RtOp::InsertUnit(handle, RtUnit::Plugin(instance.unit)));

    state.recompile(stage, &parent)
}

pub(super) fn create_port(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
    port_type: PortType,
    direction: PortDirection,
    properties: &Properties,
) -> Result<(), EngineError> {
    if state.store.contains(path) {
        return Err(EngineError::ObjectExists(path.clone()));
    }

    let owner = path
        .parent()
        .ok_or_else(|| EngineError::ObjectExists(path.clone()))?;

    match state.store.find(&owner).map(|o| o.object_type()) {
        Some(ObjectType::Patch) => {}
        Some(ObjectType::Node) => {
            return Err(EngineError::TypeMismatch(format!(
                "ports can't be added to node {}",
                owner
            )))
        }
        _ => return Err(EngineError::ParentNotFound(path.clone())),
    }

    let context = match properties.get("context") {
        None => ExecContext::Audio,
        Some(Value::String(s)) if s == "audio" => ExecContext::Audio,
        Some(Value::String(s)) if s == "message" => ExecContext::Message,
        Some(v) => {
            return Err(EngineError::TypeMismatch(format!(
                "unknown execution context {}",
                v
            )))
        }
    };

    let (voices, index) = match state.store.find_patch_mut(&state.cx, &owner) {
        Some(patch) => {
            let index = patch.next_port_index;
            patch.next_port_index += 1;
            (patch.polyphony, index)
        }
        None => return Err(EngineError::ParentNotFound(path.clone())),
    };

    let buffers = state.alloc_buffers(stage, port_type, voices, 0.0);

    let polyphonic = voices > 1;
    state.store.add(
        &state.cx,
        GraphObject::new(
            path.clone(),
            properties.clone(),
            polyphonic,
            GraphObjectKind::Port(PortData {
                index,
                direction,
                port_type,
                context,
                buffers,
                value: 0.0,
                monitor: None,
            }),
        ),
    )?;

    if let Some(patch) = state.store.find_patch_mut(&state.cx, &owner) {
        patch.ports.push(path.clone());
    }

    state.recompile(stage, &owner)?;

    stage.notify(Notification::ObjectCreated {
        path: path.clone(),
        object_type: ObjectType::Port,
    });

    Ok(())
}
