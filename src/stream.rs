use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{Read, Result as IoResult, Write};
use std::net::SocketAddr;

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::registry::PathId;
use crate::table::PathConnectionTable;
use crate::transport::ChunkTransport;
use crate::{Error, Result};

/// Bytes carried by one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathStats {
    /// Payload bytes sent over the path.
    pub sent: u64,
    /// Payload bytes received over the path.
    pub recv: u64,
}

/// A logical connection made of several path connections.
///
/// A `MultipathStream` is returned as soon as one path is up. The remaining
/// paths keep completing in the background, and every send or receive first
/// hands newly completed path sockets to the chunk transport, so throughput
/// grows as paths come in.
///
/// `MultipathStream` also implements `std::io::Read` and `std::io::Write`; a
/// read returns 0 once the peer closed the connection.
pub struct MultipathStream {
    table: PathConnectionTable,
    transport: Box<dyn ChunkTransport>,
    socket_paths: HashMap<Uuid, PathId>,
    cancel: CancelToken,
    local: SocketAddr,
    peer: SocketAddr,
    closed: bool,
}

impl MultipathStream {
    pub(crate) fn new(
        table: PathConnectionTable,
        transport: Box<dyn ChunkTransport>,
        cancel: CancelToken,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            table,
            transport,
            socket_paths: HashMap::new(),
            cancel,
            local,
            peer,
            closed: false,
        }
    }

    /// Registers path sockets that completed since the last call.
    fn sync_paths(&mut self) -> Result<()> {
        let registered = self.transport.registered_sockets();
        for (path, handle) in self.table.connected() {
            if registered.contains(&handle.id()) {
                continue;
            }
            let id = handle.id();
            log::debug!("Adding path {path} (socket {id}) to the stream");
            self.transport.add_socket(handle)?;
            self.socket_paths.insert(id, path);
        }
        Ok(())
    }

    fn on_error(&mut self, err: Error) -> Error {
        if err.is_closed() {
            log::debug!("Stream to {} closed: {err}", self.peer);
            self.cancel.cancel();
            for (path, handle) in self.table.clear() {
                if !self.socket_paths.contains_key(&handle.id()) {
                    log::debug!("Shutting down unregistered path {path}");
                    let _ = handle.shutdown();
                }
            }
        }
        err
    }

    /// Sends the whole message over the currently completed paths.
    pub fn send(&mut self, message: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::ClosedLocally);
        }
        self.sync_paths().map_err(|e| self.on_error(e))?;
        self.transport.send(message).map_err(|e| self.on_error(e))
    }

    /// One receive attempt: returns up to `max_bytes`, or [`Error::WouldBlock`]
    /// if nothing arrived within the transport's poll interval.
    pub fn try_receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::ClosedLocally);
        }
        self.sync_paths().map_err(|e| self.on_error(e))?;
        self.transport.receive(max_bytes).map_err(|e| self.on_error(e))
    }

    /// Blocks until data arrives, picking up newly completed paths while waiting.
    pub fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        loop {
            match self.try_receive(max_bytes) {
                Err(Error::WouldBlock) => continue,
                r => return r,
            }
        }
    }

    /// Closes every path. Returns `true` only for the call that actually closed the stream.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.cancel.cancel();
        // Every handle has to be known to the transport before it closes them.
        if let Err(e) = self.sync_paths() {
            log::debug!("Failed to register pending paths on close: {e}");
        }
        for (path, handle) in self.table.clear() {
            if !self.socket_paths.contains_key(&handle.id()) {
                log::debug!("Shutting down unregistered path {path}");
                let _ = handle.shutdown();
            }
        }
        if let Err(e) = self.transport.close() {
            log::debug!("Error closing transport: {e}");
        }
        log::debug!("Closed stream to {}", self.peer);
        true
    }

    /// Per-path byte counters, keyed by every path that carried a registered socket.
    pub fn stats(&self) -> BTreeMap<PathId, PathStats> {
        let sent = self.transport.sent_distribution();
        let recv = self.transport.recv_distribution();
        let mut stats = BTreeMap::new();
        for (id, path) in &self.socket_paths {
            let entry: &mut PathStats = stats.entry(path.clone()).or_default();
            entry.sent += sent.get(id).copied().unwrap_or(0);
            entry.recv += recv.get(id).copied().unwrap_or(0);
        }
        stats
    }

    /// Paths with an established connection, sorted.
    pub fn connected_paths(&self) -> Vec<PathId> {
        self.table.connected().into_iter().map(|(path, _)| path).collect()
    }

    /// Number of paths known to this stream, complete or not.
    pub fn path_count(&self) -> usize {
        self.table.len()
    }

    /// The logical peer address: the port the connection was requested on,
    /// whichever path completed first.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The logical local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Read for MultipathStream {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match self.receive(buf.len()) {
            Ok(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Err(Error::ClosedRemotely) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Write for MultipathStream {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        Ok(self.send(buf)?)
    }

    fn flush(&mut self) -> IoResult<()> {
        if self.closed {
            return Err(Error::ClosedLocally.into());
        }
        Ok(())
    }
}

impl Drop for MultipathStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MultipathStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipathStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("paths", &self.table.len())
            .field("connected", &self.table.connected_count())
            .field("closed", &self.closed)
            .finish()
    }
}
