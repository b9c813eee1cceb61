use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::Result;

/// An established connection on a single path.
///
/// Cloning a handle is cheap and keeps the same identity: the chunk transport,
/// the connection table and the socket-to-path index all refer to the same
/// stream through its `id`.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: Uuid,
    stream: Arc<TcpStream>,
}

impl SocketHandle {
    /// Wraps a connected stream, assigning it a fresh identity.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: Arc::new(stream),
        }
    }

    /// The identity used for per-socket accounting.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The underlying stream.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Returns the socket address of the remote peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Returns the socket address of the local half.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Shuts both halves down. A stream the peer already tore down is not an error.
    pub fn shutdown(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            r => Ok(r?),
        }
    }
}

/// A bound listener on a single path.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    id: Uuid,
    listener: Arc<TcpListener>,
    closed: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Wraps a bound listener.
    pub fn new(listener: TcpListener) -> Self {
        Self {
            id: Uuid::new_v4(),
            listener: Arc::new(listener),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The identity of this listener.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The underlying listener.
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Returns the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Marks the listener closed for every clone. Returns `true` on the first call.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether `mark_closed` was called on any clone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
