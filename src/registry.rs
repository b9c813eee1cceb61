use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::stack::PathStack;

/// Name of a configured path. Sorting these names decides which port offset
/// each path uses, on both endpoints.
pub type PathId = String;

/// The set of configured paths, shared between a connector or binder and the
/// background tasks it spawns.
///
/// The set can only grow: a path registered while a completion task is running
/// is picked up by that task on its next pass. Existing entries are never
/// replaced.
#[derive(Clone, Default)]
pub struct PathRegistry {
    stacks: Arc<RwLock<BTreeMap<PathId, Arc<dyn PathStack>>>>,
}

impl PathRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a path. Returns `false`, leaving the existing stack in place, if the id is taken.
    pub fn register(&self, id: impl Into<PathId>, stack: Arc<dyn PathStack>) -> bool {
        let id = id.into();
        let mut stacks = self.stacks.write();
        if stacks.contains_key(&id) {
            log::warn!("Path {id} is already registered, keeping the existing stack");
            return false;
        }
        log::debug!("Registered path {id}");
        stacks.insert(id, stack);
        true
    }

    /// Adds every path from `paths` that is not yet known. Returns how many were added.
    pub fn merge<I>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = (PathId, Arc<dyn PathStack>)>,
    {
        let mut stacks = self.stacks.write();
        let mut added = 0;
        for (id, stack) in paths {
            if !stacks.contains_key(&id) {
                stacks.insert(id, stack);
                added += 1;
            }
        }
        added
    }

    /// Looks up one path's stack.
    pub fn get(&self, id: &str) -> Option<Arc<dyn PathStack>> {
        self.stacks.read().get(id).cloned()
    }

    /// A consistent copy of every path, in sorted order.
    pub fn snapshot(&self) -> Vec<(PathId, Arc<dyn PathStack>)> {
        self.stacks
            .read()
            .iter()
            .map(|(id, stack)| (id.clone(), stack.clone()))
            .collect()
    }

    /// Sorted path ids.
    pub fn path_ids(&self) -> Vec<PathId> {
        self.stacks.read().keys().cloned().collect()
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.stacks.read().len()
    }

    /// Whether no path is registered.
    pub fn is_empty(&self) -> bool {
        self.stacks.read().is_empty()
    }
}

impl fmt::Debug for PathRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRegistry")
            .field("paths", &self.path_ids())
            .finish()
    }
}
