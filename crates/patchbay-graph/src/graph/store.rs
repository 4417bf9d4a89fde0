use std::collections::BTreeMap;
use std::ops::Bound;

use patchbay_core::Path;

use super::{GraphObject, NodeData, PatchData, PortData};
use crate::{context::ControlContext, error::EngineError};

/// The path-indexed registry of every live graph object.
///
/// The store exclusively owns the objects. Everything else refers to
/// them by path (or by realtime handle).
#[derive(Debug, Default, Clone)]
pub struct GraphObjectStore {
    objects: BTreeMap<Path, GraphObject>,
}

impl GraphObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.objects.contains_key(path)
    }

    /// Add an object at its path.
    ///
    /// Returns an error if an object already exists at that path.
    pub fn add(&mut self, _cx: &ControlContext, object: GraphObject) -> Result<(), EngineError> {
        if self.objects.contains_key(object.path()) {
            return Err(EngineError::ObjectExists(object.path().clone()));
        }

        self.objects.insert(object.path().clone(), object);
        Ok(())
    }

    pub fn find(&self, path: &Path) -> Option<&GraphObject> {
        self.objects.get(path)
    }

    pub fn find_object(&self, path: &Path) -> Option<&GraphObject> {
        self.find(path)
    }

    pub fn find_patch(&self, path: &Path) -> Option<&PatchData> {
        self.objects.get(path).and_then(|o| o.as_patch())
    }

    pub fn find_node(&self, path: &Path) -> Option<&NodeData> {
        self.objects.get(path).and_then(|o| o.as_node())
    }

    pub fn find_port(&self, path: &Path) -> Option<&PortData> {
        self.objects.get(path).and_then(|o| o.as_port())
    }

    pub fn find_mut(&mut self, _cx: &ControlContext, path: &Path) -> Option<&mut GraphObject> {
        self.objects.get_mut(path)
    }

    pub(crate) fn find_patch_mut(
        &mut self,
        cx: &ControlContext,
        path: &Path,
    ) -> Option<&mut PatchData> {
        self.find_mut(cx, path).and_then(|o| o.as_patch_mut())
    }

    pub(crate) fn find_node_mut(
        &mut self,
        cx: &ControlContext,
        path: &Path,
    ) -> Option<&mut NodeData> {
        self.find_mut(cx, path).and_then(|o| o.as_node_mut())
    }

    pub(crate) fn find_port_mut(
        &mut self,
        cx: &ControlContext,
        path: &Path,
    ) -> Option<&mut PortData> {
        self.find_mut(cx, path).and_then(|o| o.as_port_mut())
    }

    /// Iterate over every strict descendant of `path` in path order.
    pub fn descendants<'a>(
        &'a self,
        path: &Path,
    ) -> impl Iterator<Item = (&'a Path, &'a GraphObject)> + 'a {
        let (lower, upper) = path.descendant_bounds();
        let upper = match upper {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };

        self.objects
            .range::<str, _>((Bound::Included(lower.as_str()), bound_as_str(&upper)))
    }

    /// Remove the object at `path` along with every descendant.
    ///
    /// The removed objects are returned in path order, so the object
    /// itself comes first. If nothing exists at `path`, nothing is
    /// removed.
    pub fn remove(&mut self, _cx: &ControlContext, path: &Path) -> Vec<GraphObject> {
        let Some(object) = self.objects.remove(path) else {
            return Vec::new();
        };

        let descendants: Vec<Path> = self.descendants(path).map(|(p, _)| p.clone()).collect();

        let mut removed = Vec::with_capacity(descendants.len() + 1);
        removed.push(object);
        for p in descendants {
            if let Some(o) = self.objects.remove(&p) {
                removed.push(o);
            }
        }

        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &GraphObject)> {
        self.objects.iter()
    }
}

fn bound_as_str(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(s) => Bound::Included(s.as_str()),
        Bound::Excluded(s) => Bound::Excluded(s.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
