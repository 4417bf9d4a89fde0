use patchbay_core::{Path, PortType};

use super::{ControlState, Stage};
use crate::{
    error::EngineError,
    graph::{connection_patch, creates_cycle, valid_endpoints, Connection, ObjectType, PortData},
    notify::Notification,
};

/// Derive `(must_mix, must_queue)` for a connection between two ports.
pub(super) fn classify(src: &PortData, dst: &PortData) -> (bool, bool) {
    (src.voices() > dst.voices(), src.context != dst.context)
}

pub(super) fn connect(
    state: &mut ControlState,
    stage: &mut Stage,
    src: &Path,
    dst: &Path,
) -> Result<(), EngineError> {
    let src_port = state
        .store
        .find_port(src)
        .ok_or_else(|| EngineError::ObjectNotFound(src.clone()))?;
    let dst_port = state
        .store
        .find_port(dst)
        .ok_or_else(|| EngineError::ObjectNotFound(dst.clone()))?;

    let patch = connection_patch(&state.store, src, dst)
        .ok_or_else(|| EngineError::ParentNotFound(dst.clone()))?;

    if state
        .store
        .find_patch(&patch)
        .is_some_and(|p| p.connection(src, dst).is_some())
    {
        return Err(EngineError::ObjectExists(dst.clone()));
    }

    if src_port.port_type != dst_port.port_type {
        return Err(EngineError::TypeMismatch(format!(
            "can't connect {:?} port {} to {:?} port {}",
            src_port.port_type, src, dst_port.port_type, dst
        )));
    }

    if !valid_endpoints(&patch, src, src_port, dst, dst_port) {
        return Err(EngineError::TypeMismatch(format!(
            "{} can't feed {} inside {}",
            src, dst, patch
        )));
    }

    let port_type = dst_port.port_type;
    let (must_mix, must_queue) = classify(src_port, dst_port);

    if must_queue && port_type == PortType::Event {
        return Err(EngineError::TypeMismatch(format!(
            "event ports {} and {} run in different contexts",
            src, dst
        )));
    }

    if !must_queue {
        let (Some(src_owner), Some(dst_owner)) = (src.parent(), dst.parent()) else {
            return Err(EngineError::ParentNotFound(dst.clone()));
        };

        if creates_cycle(&state.store, &patch, &src_owner, &dst_owner) {
            return Err(EngineError::CycleRejected {
                src: src.clone(),
                dst: dst.clone(),
            });
        }
    }

    let mut connection = Connection {
        src: src.clone(),
        dst: dst.clone(),
        must_mix,
        must_queue,
        local: None,
        queue: None,
        dropped: None,
    };
    state.attach_connection_storage(stage, &mut connection, port_type);

    if let Some(p) = state.store.find_patch_mut(&state.cx, &patch) {
        p.connections.push(connection);
    }

    state.recompile(stage, &patch)?;

    stage.notify(Notification::Connected {
        src: src.clone(),
        dst: dst.clone(),
    });

    Ok(())
}

pub(super) fn disconnect(
    state: &mut ControlState,
    stage: &mut Stage,
    src: &Path,
    dst: &Path,
) -> Result<(), EngineError> {
    let not_found = || EngineError::ObjectNotFound(dst.clone());

    let patch = connection_patch(&state.store, src, dst).ok_or_else(not_found)?;
    let removed = remove_connections(state, stage, &patch, |c| &c.src == src && &c.dst == dst);

    if removed == 0 {
        return Err(not_found());
    }

    state.recompile(stage, &patch)
}

pub(super) fn disconnect_all(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
) -> Result<(), EngineError> {
    let object_type = state
        .store
        .find(path)
        .map(|o| o.object_type())
        .ok_or_else(|| EngineError::ObjectNotFound(path.clone()))?;

    let parent = path.parent();

    match object_type {
        ObjectType::Port => {
            let Some(owner) = parent else {
                return Err(EngineError::InternalError(format!("port {} has no owner", path)));
            };

            // A patch port has connections on both sides of the boundary.
            let inside = state.store.find_patch(&owner).is_some();
            let mut removed = 0;

            if inside {
                removed += remove_connections(state, stage, &owner, |c| c.touches_port(path));
            }
            if let Some(outer) = owner.parent() {
                removed += remove_connections(state, stage, &outer, |c| c.touches_port(path));
            }

            if removed > 0 {
                match owner.parent() {
                    Some(outer) if !inside => state.recompile(stage, &outer)?,
                    _ => state.recompile(stage, &owner)?,
                }
            }
        }
        ObjectType::Node | ObjectType::Patch => {
            let inside = object_type == ObjectType::Patch;
            let mut removed = 0;

            if inside {
                removed += remove_connections(state, stage, path, |c| c.touches_owner(path));
            }
            if let Some(parent) = &parent {
                removed += remove_connections(state, stage, parent, |c| c.touches_owner(path));
            }

            if removed > 0 {
                match parent {
                    Some(parent) if !inside => state.recompile(stage, &parent)?,
                    _ => state.recompile(stage, path)?,
                }
            }
        }
    }

    Ok(())
}

/// Remove every connection of `patch` matching `pred`, release its
/// storage and stage a [`Notification::Disconnected`] for it.
///
/// Does not recompile. Returns the number of removed connections.
pub(super) fn remove_connections(
    state: &mut ControlState,
    stage: &mut Stage,
    patch: &Path,
    pred: impl Fn(&Connection) -> bool,
) -> usize {
    let Some(data) = state.store.find_patch_mut(&state.cx, patch) else {
        return 0;
    };

    let (removed, kept): (Vec<Connection>, Vec<Connection>) =
        std::mem::take(&mut data.connections)
            .into_iter()
            .partition(|c| pred(c));
    data.connections = kept;

    let n = removed.len();
    for mut c in removed {
        state.release_connection(stage, &mut c);
        stage.notify(Notification::Disconnected {
            src: c.src.clone(),
            dst: c.dst.clone(),
        });
    }

    n
}

/// Derive the flags of every connection in `patch` again, and swap the
/// private storage of the ones that changed.
pub(super) fn reclassify(state: &mut ControlState, stage: &mut Stage, patch: &Path) {
    let Some(data) = state.store.find_patch_mut(&state.cx, patch) else {
        return;
    };
    let mut connections = std::mem::take(&mut data.connections);

    for c in connections.iter_mut() {
        let (Some(src), Some(dst)) = (state.store.find_port(&c.src), state.store.find_port(&c.dst))
        else {
            continue;
        };

        let port_type = dst.port_type;
        let (must_mix, must_queue) = classify(src, dst);

        if must_mix != c.must_mix || must_queue != c.must_queue {
            state.release_connection(stage, c);
            c.must_mix = must_mix;
            c.must_queue = must_queue;
            state.attach_connection_storage(stage, c, port_type);
        }
    }

    if let Some(data) = state.store.find_patch_mut(&state.cx, patch) {
        data.connections = connections;
    }
}
