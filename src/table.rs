//! The shared map from path to per-path connection state.
//!
//! A table is written by the synchronous first pass, by a background
//! completion task and by the aggregate that owns it. Every read that needs a
//! consistent view copies the entries out under the lock and works on the copy.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::{ListenerHandle, SocketHandle};
use crate::registry::PathId;

/// State of one path.
#[derive(Debug, Clone)]
pub struct PathEntry<H> {
    /// Remote port used (or observed) on this path.
    pub dest_port: u16,
    /// Local port used on this path.
    pub local_port: u16,
    /// Set once the path is up; never unset except by clearing the table.
    pub handle: Option<H>,
}

#[derive(Debug)]
struct TableState<H> {
    entries: BTreeMap<PathId, PathEntry<H>>,
    cleared: bool,
}

/// Mutex-guarded table of paths, cheap to clone and share.
#[derive(Debug)]
pub struct PathTable<H> {
    state: Arc<Mutex<TableState<H>>>,
}

/// Connection table of an aggregate stream.
pub type PathConnectionTable = PathTable<SocketHandle>;

/// Listener table of an aggregate listener.
pub type ListenerTable = PathTable<ListenerHandle>;

impl<H> Clone for PathTable<H> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<H> Default for PathTable<H> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                entries: BTreeMap::new(),
                cleared: false,
            })),
        }
    }
}

impl<H: Clone> PathTable<H> {
    /// An empty, open table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a path that has not completed yet.
    ///
    /// Returns `false` if the table was cleared or already knows the path.
    pub fn insert_pending(&self, path: &str, dest_port: u16, local_port: u16) -> bool {
        let mut state = self.state.lock();
        if state.cleared || state.entries.contains_key(path) {
            return false;
        }
        state.entries.insert(
            path.to_string(),
            PathEntry {
                dest_port,
                local_port,
                handle: None,
            },
        );
        true
    }

    /// Stores the handle of a completed path.
    ///
    /// The handle is given back when it cannot be stored: the table was
    /// cleared, the path is unknown, or the path already has a handle.
    pub fn install(&self, path: &str, handle: H) -> Result<(), H> {
        let mut state = self.state.lock();
        if state.cleared {
            return Err(handle);
        }
        match state.entries.get_mut(path) {
            Some(entry) if entry.handle.is_none() => {
                entry.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Records the remote port actually observed on a path.
    pub fn set_dest_port(&self, path: &str, dest_port: u16) {
        if let Some(entry) = self.state.lock().entries.get_mut(path) {
            entry.dest_port = dest_port;
        }
    }

    /// Copy of every entry, in sorted path order.
    pub fn snapshot(&self) -> Vec<(PathId, PathEntry<H>)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect()
    }

    /// Paths still waiting for a handle.
    pub fn pending(&self) -> Vec<(PathId, PathEntry<H>)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.handle.is_none())
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect()
    }

    /// Completed paths and their handles.
    pub fn connected(&self) -> Vec<(PathId, H)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter_map(|(path, entry)| entry.handle.clone().map(|h| (path.clone(), h)))
            .collect()
    }

    /// The handle of one path, if completed.
    pub fn handle(&self, path: &str) -> Option<H> {
        self.state
            .lock()
            .entries
            .get(path)
            .and_then(|entry| entry.handle.clone())
    }

    /// Drops a path that will never complete.
    ///
    /// Completed paths are kept; returns whether an entry was removed.
    pub fn abandon(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(path) {
            Some(entry) if entry.handle.is_none() => state.entries.remove(path).is_some(),
            _ => false,
        }
    }

    /// Number of completed paths.
    pub fn connected_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.handle.is_some())
            .count()
    }

    /// Whether the path is in the table.
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    /// Number of paths in the table.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the table holds no path.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Empties the table for good and hands back every stored handle.
    ///
    /// Later inserts and installs are refused.
    pub fn clear(&self) -> Vec<(PathId, H)> {
        let mut state = self.state.lock();
        state.cleared = true;
        std::mem::take(&mut state.entries)
            .into_iter()
            .filter_map(|(path, entry)| entry.handle.map(|h| (path, h)))
            .collect()
    }

    /// Whether `clear` was called.
    pub fn is_cleared(&self) -> bool {
        self.state.lock().cleared
    }
}
