//! Chunk transports: the engines that spread a message over a set of path sockets
//! and put it back together on the other side.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bincode::config::{self, Configuration, Fixint, LittleEndian};
use bincode::{Decode, Encode};
use polling::{Event, Events, Poller};
use uuid::Uuid;

use crate::config::MultipathConfig;
use crate::handle::SocketHandle;
use crate::{Error, Result};

/// Distributes messages across a growing set of sockets.
///
/// An aggregate stream registers path sockets as they complete and forwards
/// every send and receive here. Implementations report
/// [`Error::ClosedLocally`] once closed and [`Error::ClosedRemotely`] when a
/// peer tears a socket down.
pub trait ChunkTransport: Send {
    /// Starts carrying traffic over `socket`. Adding a socket twice is a no-op.
    fn add_socket(&mut self, socket: SocketHandle) -> Result<()>;

    /// Ids of every socket added so far.
    fn registered_sockets(&self) -> HashSet<Uuid>;

    /// Sends the whole message, returning the number of bytes sent.
    fn send(&mut self, message: &[u8]) -> Result<usize>;

    /// Returns up to `max_bytes` of in-order data, or [`Error::WouldBlock`]
    /// if none arrived within one poll interval.
    fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>>;

    /// Closes every registered socket.
    fn close(&mut self) -> Result<()>;

    /// Payload bytes sent per socket.
    fn sent_distribution(&self) -> HashMap<Uuid, u64>;

    /// Payload bytes received per socket.
    fn recv_distribution(&self) -> HashMap<Uuid, u64>;
}

/// Builds a fresh transport for every aggregate stream.
pub type TransportFactory =
    Arc<dyn Fn(&MultipathConfig) -> Result<Box<dyn ChunkTransport>> + Send + Sync>;

/// Factory producing [`StripedTransport`]s.
pub fn striped_factory() -> TransportFactory {
    Arc::new(|config: &MultipathConfig| -> Result<Box<dyn ChunkTransport>> {
        Ok(Box::new(StripedTransport::new(config)?))
    })
}

const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
struct FrameHeader {
    seq: u64,
    len: u32,
}

fn codec() -> Configuration<LittleEndian, Fixint> {
    config::standard().with_fixed_int_encoding()
}

/// Round-robin striping over path sockets.
///
/// Every message is cut into fragments of at most `fragment_size` bytes. Each
/// fragment goes out whole on the next socket in turn, behind a header carrying
/// a global sequence number and the payload length. The receiver waits for any
/// registered socket to become readable, reads whole frames, and hands bytes
/// out strictly in sequence order, so sockets may be registered on the two
/// ends at different times.
pub struct StripedTransport {
    sockets: Vec<SocketHandle>,
    poller: Poller,
    events: Events,
    next_socket: usize,
    send_seq: u64,
    recv_seq: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
    ready: VecDeque<u8>,
    sent: HashMap<Uuid, u64>,
    received: HashMap<Uuid, u64>,
    fragment_size: usize,
    max_frame_len: usize,
    poll_interval: Duration,
    finished: HashSet<usize>,
    peer_closed: bool,
    closed: bool,
}

impl StripedTransport {
    /// Creates a transport with no sockets.
    pub fn new(config: &MultipathConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sockets: Vec::new(),
            poller: Poller::new()?,
            events: Events::new(),
            next_socket: 0,
            send_seq: 0,
            recv_seq: 0,
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
            sent: HashMap::new(),
            received: HashMap::new(),
            fragment_size: config.fragment_size,
            max_frame_len: config.max_frame_len,
            poll_interval: config.receive_poll_interval,
            finished: HashSet::new(),
            peer_closed: false,
            closed: false,
        })
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let header = FrameHeader {
            seq: self.send_seq,
            len: payload.len() as u32,
        };
        let mut frame = vec![0u8; HEADER_LEN + payload.len()];
        let n = bincode::encode_into_slice(header, &mut frame[..HEADER_LEN], codec())?;
        if n != HEADER_LEN {
            return Err(Error::Internal(format!("frame header encoded to {n} bytes")));
        }
        frame[HEADER_LEN..].copy_from_slice(payload);

        let socket = &self.sockets[self.next_socket];
        log::trace!(
            "Writing frame {} ({} bytes) using socket {}",
            header.seq,
            payload.len(),
            self.next_socket
        );
        let mut stream = socket.stream();
        stream.write_all(&frame)?;
        *self.sent.entry(socket.id()).or_default() += payload.len() as u64;

        self.send_seq += 1;
        self.next_socket = (self.next_socket + 1) % self.sockets.len();
        Ok(())
    }

    fn read_frame(&mut self, key: usize) -> Result<()> {
        let socket = self
            .sockets
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("readiness for unknown socket {key}")))?;
        let mut stream = socket.stream();

        let mut header_buf = [0u8; HEADER_LEN];
        stream.read_exact(&mut header_buf)?;
        let (header, _): (FrameHeader, usize) = bincode::decode_from_slice(&header_buf, codec())?;
        let len = header.len as usize;
        if len > self.max_frame_len {
            return Err(Error::Codec(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload)?;
        *self.received.entry(socket.id()).or_default() += len as u64;
        log::trace!("Read frame {} ({len} bytes) from socket {key}", header.seq);

        if header.seq < self.recv_seq || self.reorder.contains_key(&header.seq) {
            log::warn!("Dropping duplicate frame {}", header.seq);
        } else {
            self.reorder.insert(header.seq, payload);
        }
        Ok(())
    }

    fn release_in_order(&mut self) {
        while let Some(payload) = self.reorder.remove(&self.recv_seq) {
            self.ready.extend(payload);
            self.recv_seq += 1;
        }
    }

    fn fill_ready(&mut self) -> Result<()> {
        loop {
            self.release_in_order();
            if !self.ready.is_empty() {
                return Ok(());
            }
            if self.sockets.is_empty() {
                return Err(Error::WouldBlock);
            }
            if self.peer_closed && self.finished.len() == self.sockets.len() {
                return Err(Error::ClosedRemotely);
            }

            self.events.clear();
            match self.poller.wait(&mut self.events, Some(self.poll_interval)) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Err(Error::WouldBlock),
                Err(e) => return Err(e.into()),
            }
            let keys: Vec<usize> = self.events.iter().map(|e| e.key).collect();
            if keys.is_empty() {
                // Once the peer has closed, nothing left to drain means the stream is over.
                return Err(if self.peer_closed {
                    Error::ClosedRemotely
                } else {
                    Error::WouldBlock
                });
            }

            let mut first_err = None;
            for key in keys {
                let Some(socket) = self.sockets.get(key).cloned() else {
                    continue;
                };
                match self.read_frame(key) {
                    Err(Error::ClosedRemotely) => {
                        log::debug!("Socket {} closed by peer", socket.id());
                        self.peer_closed = true;
                        self.finished.insert(key);
                        let _ = self.poller.delete(socket.stream());
                        continue;
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                    Ok(()) => {}
                }
                // Re-armed even when the read failed, or the socket is never reported again.
                if let Err(e) = self.poller.modify(socket.stream(), Event::readable(key)) {
                    first_err.get_or_insert(e.into());
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }
    }
}

impl ChunkTransport for StripedTransport {
    fn add_socket(&mut self, socket: SocketHandle) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedLocally);
        }
        if self.sockets.iter().any(|s| s.id() == socket.id()) {
            return Ok(());
        }
        let key = self.sockets.len();
        // SAFETY: the stream stays in `self.sockets` until `close` deletes it from the poller.
        unsafe {
            self.poller.add(socket.stream(), Event::readable(key))?;
        }
        self.sent.entry(socket.id()).or_insert(0);
        self.received.entry(socket.id()).or_insert(0);
        log::debug!("Striping over socket {} (key {key})", socket.id());
        self.sockets.push(socket);
        Ok(())
    }

    fn registered_sockets(&self) -> HashSet<Uuid> {
        self.sockets.iter().map(SocketHandle::id).collect()
    }

    fn send(&mut self, message: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::ClosedLocally);
        }
        if self.peer_closed {
            return Err(Error::ClosedRemotely);
        }
        if self.sockets.is_empty() {
            return Err(Error::Internal("send with no registered socket".into()));
        }
        for fragment in message.chunks(self.fragment_size) {
            if let Err(e) = self.write_frame(fragment) {
                if matches!(e, Error::ClosedRemotely) {
                    self.peer_closed = true;
                }
                return Err(e);
            }
        }
        Ok(message.len())
    }

    fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::ClosedLocally);
        }
        if max_bytes == 0 {
            return Ok(Vec::new());
        }
        if self.ready.is_empty() {
            self.fill_ready()?;
        }
        let n = max_bytes.min(self.ready.len());
        Ok(self.ready.drain(..n).collect())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        for socket in self.sockets.drain(..) {
            let _ = self.poller.delete(socket.stream());
            if let Err(e) = socket.shutdown() {
                log::debug!("Failed to shut down socket {}: {e}", socket.id());
                first_err.get_or_insert(e);
            }
        }
        self.reorder.clear();
        self.ready.clear();
        first_err.map_or(Ok(()), Err)
    }

    fn sent_distribution(&self) -> HashMap<Uuid, u64> {
        self.sent.clone()
    }

    fn recv_distribution(&self) -> HashMap<Uuid, u64> {
        self.received.clone()
    }
}

impl Drop for StripedTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
