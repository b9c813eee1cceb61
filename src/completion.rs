//! Background tasks that keep retrying the paths a synchronous pass left incomplete.
//!
//! One task runs per aggregate. It stops when every path it still cares about
//! has a handle, when its [`CancelToken`] is cancelled, or when the table it
//! feeds has been cleared. Errors are swallowed and retried on the next pass,
//! except [`Error::ClosedLocally`], which drops the path for good.

use std::collections::HashSet;
use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::handle::{ListenerHandle, SocketHandle};
use crate::ports::spread_port;
use crate::registry::{PathId, PathRegistry};
use crate::table::{ListenerTable, PathConnectionTable, PathEntry, PathTable};
use crate::{Error, Result};

/// One flavour of completion: what to retry and what to do with a late result.
pub(crate) trait Completion {
    type Handle: Clone;

    fn table(&self) -> &PathTable<Self::Handle>;

    /// Brings paths registered since the last pass into the table.
    fn adopt_new_paths(&mut self, _abandoned: &mut HashSet<PathId>) {}

    /// One attempt at completing `path`. `Ok(None)` skips the path this pass.
    fn attempt(&mut self, path: &str, entry: &PathEntry<Self::Handle>) -> Result<Option<Self::Handle>>;

    /// Disposes of a handle the table refused.
    fn discard(&self, path: &str, handle: Self::Handle);
}

/// Spawns `task` on its own thread.
pub(crate) fn spawn<C>(
    name: String,
    task: C,
    cancel: CancelToken,
    interval: Duration,
    abandoned: HashSet<PathId>,
) -> Result<()>
where
    C: Completion + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(move || run(task, cancel, interval, abandoned))?;
    Ok(())
}

fn run<C: Completion>(mut task: C, cancel: CancelToken, interval: Duration, mut abandoned: HashSet<PathId>) {
    let name = thread::current().name().unwrap_or("completion").to_string();
    log::debug!("[{name}] started");
    loop {
        if cancel.is_cancelled() || task.table().is_cleared() {
            break;
        }
        task.adopt_new_paths(&mut abandoned);
        let pending: Vec<_> = task
            .table()
            .pending()
            .into_iter()
            .filter(|(path, _)| !abandoned.contains(path))
            .collect();
        if pending.is_empty() {
            break;
        }

        for (path, entry) in pending {
            if cancel.is_cancelled() {
                break;
            }
            match task.attempt(&path, &entry) {
                Ok(Some(handle)) => match task.table().install(&path, handle) {
                    Ok(()) => log::debug!("[{name}] path {path} completed"),
                    Err(handle) => {
                        log::debug!("[{name}] discarding late handle for path {path}");
                        task.discard(&path, handle);
                    }
                },
                Ok(None) => {}
                Err(Error::ClosedLocally) => {
                    log::debug!("[{name}] path {path} closed locally, no more retries");
                    task.table().abandon(&path);
                    abandoned.insert(path);
                }
                Err(e) if e.is_transient() => log::trace!("[{name}] path {path}: {e}"),
                Err(e) => log::debug!("[{name}] path {path} retry failed: {e}"),
            }
        }
        thread::sleep(interval);
    }
    log::debug!("[{name}] finished");
}

/// Paths registered after the first pass get the ports of their sorted position.
fn adopt<H: Clone>(
    table: &PathTable<H>,
    registry: &PathRegistry,
    abandoned: &mut HashSet<PathId>,
    ports: impl Fn(usize) -> Result<(u16, u16)>,
) {
    for (ordinal, path) in registry.path_ids().into_iter().enumerate() {
        if table.contains(&path) || abandoned.contains(&path) {
            continue;
        }
        match ports(ordinal) {
            Ok((dest_port, local_port)) => {
                if table.insert_pending(&path, dest_port, local_port) {
                    log::debug!("Path {path} joined at ordinal {ordinal}");
                }
            }
            Err(e) => {
                log::warn!("Path {path} cannot be used: {e}");
                abandoned.insert(path);
            }
        }
    }
}

/// Retries outbound connections for a [`crate::MultipathStream`].
pub(crate) struct ConnectCompletion {
    pub table: PathConnectionTable,
    pub registry: PathRegistry,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub timeout: Duration,
}

impl Completion for ConnectCompletion {
    type Handle = SocketHandle;

    fn table(&self) -> &PathConnectionTable {
        &self.table
    }

    fn adopt_new_paths(&mut self, abandoned: &mut HashSet<PathId>) {
        let (dest_port, local_port) = (self.dest_port, self.local_port);
        adopt(&self.table, &self.registry, abandoned, |ordinal| {
            Ok((spread_port(dest_port, ordinal)?, spread_port(local_port, ordinal)?))
        });
    }

    fn attempt(&mut self, path: &str, entry: &PathEntry<SocketHandle>) -> Result<Option<SocketHandle>> {
        let Some(stack) = self.registry.get(path) else {
            return Ok(None);
        };
        stack
            .open_connection(self.dest_ip, entry.dest_port, self.local_ip, entry.local_port, self.timeout)
            .map(Some)
    }

    fn discard(&self, _path: &str, handle: SocketHandle) {
        let _ = handle.shutdown();
    }
}

/// Retries binding the listeners a [`crate::MultipathListener`] could not bind at first.
pub(crate) struct ListenCompletion {
    pub table: ListenerTable,
    pub registry: PathRegistry,
    pub local_ip: IpAddr,
    pub local_port: u16,
}

impl Completion for ListenCompletion {
    type Handle = ListenerHandle;

    fn table(&self) -> &ListenerTable {
        &self.table
    }

    fn adopt_new_paths(&mut self, abandoned: &mut HashSet<PathId>) {
        let local_port = self.local_port;
        adopt(&self.table, &self.registry, abandoned, |ordinal| {
            Ok((0, spread_port(local_port, ordinal)?))
        });
    }

    fn attempt(&mut self, path: &str, entry: &PathEntry<ListenerHandle>) -> Result<Option<ListenerHandle>> {
        let Some(stack) = self.registry.get(path) else {
            return Ok(None);
        };
        stack
            .listen_for_connection(self.local_ip, entry.local_port)
            .map(Some)
    }

    fn discard(&self, path: &str, handle: ListenerHandle) {
        if let Some(stack) = self.registry.get(path) {
            let _ = stack.close_listener(&handle);
        }
    }
}

/// Accepts the remaining paths of one accepted [`crate::MultipathStream`].
pub(crate) struct AcceptCompletion {
    pub table: PathConnectionTable,
    pub listeners: ListenerTable,
    pub registry: PathRegistry,
}

impl Completion for AcceptCompletion {
    type Handle = SocketHandle;

    fn table(&self) -> &PathConnectionTable {
        &self.table
    }

    fn attempt(&mut self, path: &str, _entry: &PathEntry<SocketHandle>) -> Result<Option<SocketHandle>> {
        if self.listeners.is_cleared() || !self.listeners.contains(path) {
            return Err(Error::ClosedLocally);
        }
        let (Some(listener), Some(stack)) = (self.listeners.handle(path), self.registry.get(path)) else {
            // Not bound yet; the listener's own completion task may still bind it.
            return Ok(None);
        };
        let (_ip, remote_port, handle) = stack.accept(&listener)?;
        self.table.set_dest_port(path, remote_port);
        Ok(Some(handle))
    }

    fn discard(&self, _path: &str, handle: SocketHandle) {
        let _ = handle.shutdown();
    }
}
