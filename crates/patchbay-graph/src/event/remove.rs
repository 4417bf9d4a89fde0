use patchbay_core::Path;

use super::{connect::remove_connections, ControlState, Stage, WatchOp};
use crate::{error::EngineError, graph::ObjectType, notify::Notification};

pub(super) fn destroy(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Err(EngineError::InternalError(String::from(
            "the root patch can't be destroyed",
        )));
    };

    let object_type = state
        .store
        .find(path)
        .map(|o| o.object_type())
        .ok_or_else(|| EngineError::ObjectNotFound(path.clone()))?;

    match object_type {
        ObjectType::Port => {
            if state.store.find_patch(&parent).is_none() {
                return Err(EngineError::TypeMismatch(format!(
                    "port {} belongs to a node and can't be destroyed on its own",
                    path
                )));
            }

            remove_connections(state, stage, &parent, |c| c.touches_port(path));
            if let Some(outer) = parent.parent() {
                remove_connections(state, stage, &outer, |c| c.touches_port(path));
            }

            if let Some(owner) = state.store.find_patch_mut(&state.cx, &parent) {
                owner.ports.retain(|p| p != path);
            }
        }
        ObjectType::Node | ObjectType::Patch => {
            remove_connections(state, stage, &parent, |c| c.touches_owner(path));

            if let Some(owner) = state.store.find_patch_mut(&state.cx, &parent) {
                owner.nodes.retain(|p| p != path);
            }
        }
    }

    remove_subtree(state, stage, path);

    state.recompile(stage, &parent)
}

pub(super) fn clear_patch(
    state: &mut ControlState,
    stage: &mut Stage,
    path: &Path,
) -> Result<(), EngineError> {
    let nodes = match state.store.find(path) {
        None => return Err(EngineError::ObjectNotFound(path.clone())),
        Some(object) => match object.as_patch() {
            Some(patch) => patch.nodes.clone(),
            None => {
                return Err(EngineError::TypeMismatch(format!(
                    "{} is not a patch",
                    path
                )))
            }
        },
    };

    remove_connections(state, stage, path, |_| true);

    if let Some(patch) = state.store.find_patch_mut(&state.cx, path) {
        patch.nodes.clear();
    }

    for node in nodes.iter() {
        remove_subtree(state, stage, node);
    }

    state.recompile(stage, path)?;

    stage.notify(Notification::PatchCleared { path: path.clone() });

    Ok(())
}

/// Remove an object and everything below it from the store, and stage
/// the release of all of their realtime state.
fn remove_subtree(state: &mut ControlState, stage: &mut Stage, path: &Path) {
    let mut removed = state.store.remove(&state.cx, path);

    for object in removed.iter_mut() {
        state.release_object(stage, object);
        stage.notify(Notification::ObjectDestroyed {
            path: object.path().clone(),
        });
    }

    log::debug!("removed {} objects under {}", removed.len(), path);

    stage.watches.push(WatchOp::UnwatchUnder(path.clone()));
    stage.removed.append(&mut removed);
}
