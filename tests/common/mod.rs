//! Scripted path stacks and a recording chunk transport for driving the
//! multipath logic without real networks.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use multipath_shim::{
    ChunkTransport, Error, ListenerHandle, MultipathConfig, PathStack, Result, SocketHandle,
    TransportFactory,
};
use parking_lot::Mutex;
use uuid::Uuid;

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// What a scripted call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Refused,
    TimedOut,
    WouldBlock,
    AddrInUse,
    ClosedLocally,
}

impl Outcome {
    fn error(self) -> Error {
        match self {
            Outcome::Succeed => unreachable!("success has no error"),
            Outcome::Refused => Error::ConnectionRefused,
            Outcome::TimedOut => Error::TimedOut,
            Outcome::WouldBlock => Error::WouldBlock,
            Outcome::AddrInUse => Error::AddressInUse,
            Outcome::ClosedLocally => Error::ClosedLocally,
        }
    }
}

#[derive(Debug)]
struct Script {
    queued: VecDeque<Outcome>,
    fallback: Outcome,
}

impl Script {
    fn always(outcome: Outcome) -> Mutex<Self> {
        Mutex::new(Self {
            queued: VecDeque::new(),
            fallback: outcome,
        })
    }

    fn next(&mut self) -> Outcome {
        self.queued.pop_front().unwrap_or(self.fallback)
    }
}

/// A path stack whose connect, listen and accept results are scripted.
///
/// Successful calls produce real loopback sockets; the far ends are kept
/// alive inside the stack.
#[derive(Debug)]
pub struct ScriptedStack {
    connect: Mutex<Script>,
    listen: Mutex<Script>,
    accept: Mutex<Script>,
    remote_port: u16,
    connect_calls: Mutex<Vec<(u16, u16)>>,
    listen_calls: Mutex<Vec<u16>>,
    accept_calls: Mutex<usize>,
    closed_listeners: Mutex<usize>,
    peers: Mutex<Vec<TcpStream>>,
}

impl ScriptedStack {
    pub fn new() -> Self {
        Self {
            connect: Script::always(Outcome::Succeed),
            listen: Script::always(Outcome::Succeed),
            accept: Script::always(Outcome::Succeed),
            remote_port: 40000,
            connect_calls: Mutex::new(Vec::new()),
            listen_calls: Mutex::new(Vec::new()),
            accept_calls: Mutex::new(0),
            closed_listeners: Mutex::new(0),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(self, queued: &[Outcome], fallback: Outcome) -> Self {
        *self.connect.lock() = Script {
            queued: queued.iter().copied().collect(),
            fallback,
        };
        self
    }

    pub fn listens(self, queued: &[Outcome], fallback: Outcome) -> Self {
        *self.listen.lock() = Script {
            queued: queued.iter().copied().collect(),
            fallback,
        };
        self
    }

    pub fn accepts(self, queued: &[Outcome], fallback: Outcome) -> Self {
        *self.accept.lock() = Script {
            queued: queued.iter().copied().collect(),
            fallback,
        };
        self
    }

    /// Remote port reported by successful accepts.
    pub fn remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// `(dest_port, local_port)` of every connect attempt.
    pub fn connect_calls(&self) -> Vec<(u16, u16)> {
        self.connect_calls.lock().clone()
    }

    pub fn listen_calls(&self) -> Vec<u16> {
        self.listen_calls.lock().clone()
    }

    pub fn accept_calls(&self) -> usize {
        *self.accept_calls.lock()
    }

    pub fn closed_listeners(&self) -> usize {
        *self.closed_listeners.lock()
    }

    fn pair(&self) -> SocketHandle {
        let (near, far) = loopback_pair();
        self.peers.lock().push(far);
        SocketHandle::new(near)
    }
}

impl PathStack for ScriptedStack {
    fn open_connection(
        &self,
        _dest_ip: IpAddr,
        dest_port: u16,
        _local_ip: IpAddr,
        local_port: u16,
        _timeout: Duration,
    ) -> Result<SocketHandle> {
        self.connect_calls.lock().push((dest_port, local_port));
        match self.connect.lock().next() {
            Outcome::Succeed => Ok(self.pair()),
            other => Err(other.error()),
        }
    }

    fn listen_for_connection(&self, _local_ip: IpAddr, local_port: u16) -> Result<ListenerHandle> {
        self.listen_calls.lock().push(local_port);
        match self.listen.lock().next() {
            Outcome::Succeed => {
                let listener = TcpListener::bind((LOOPBACK, 0)).expect("bind loopback");
                listener.set_nonblocking(true).expect("nonblocking");
                Ok(ListenerHandle::new(listener))
            }
            other => Err(other.error()),
        }
    }

    fn accept(&self, listener: &ListenerHandle) -> Result<(IpAddr, u16, SocketHandle)> {
        *self.accept_calls.lock() += 1;
        if listener.is_closed() {
            return Err(Error::ClosedLocally);
        }
        match self.accept.lock().next() {
            Outcome::Succeed => Ok((LOOPBACK, self.remote_port, self.pair())),
            other => Err(other.error()),
        }
    }

    fn close_listener(&self, listener: &ListenerHandle) -> Result<()> {
        if listener.mark_closed() {
            *self.closed_listeners.lock() += 1;
        }
        Ok(())
    }
}

pub fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind((LOOPBACK, 0)).expect("bind loopback");
    let near = TcpStream::connect(listener.local_addr().expect("local addr")).expect("connect");
    let (far, _) = listener.accept().expect("accept");
    (near, far)
}

/// What the recording transport saw, shared with the test.
#[derive(Debug, Default)]
pub struct TransportState {
    pub sockets: Vec<Uuid>,
    pub sent: HashMap<Uuid, u64>,
    pub recv: HashMap<Uuid, u64>,
    pub inbox: VecDeque<u8>,
    pub remote_closed: bool,
    pub closed: bool,
    pub close_calls: usize,
}

/// A transport that copies every message to every registered socket's counter.
pub struct RecordingTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ChunkTransport for RecordingTransport {
    fn add_socket(&mut self, socket: SocketHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ClosedLocally);
        }
        if !state.sockets.contains(&socket.id()) {
            state.sockets.push(socket.id());
            state.sent.insert(socket.id(), 0);
            state.recv.insert(socket.id(), 0);
        }
        Ok(())
    }

    fn registered_sockets(&self) -> HashSet<Uuid> {
        self.state.lock().sockets.iter().copied().collect()
    }

    fn send(&mut self, message: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ClosedLocally);
        }
        if state.remote_closed {
            return Err(Error::ClosedRemotely);
        }
        let ids = state.sockets.clone();
        for id in ids {
            *state.sent.entry(id).or_default() += message.len() as u64;
        }
        Ok(message.len())
    }

    fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ClosedLocally);
        }
        if state.remote_closed {
            return Err(Error::ClosedRemotely);
        }
        if state.inbox.is_empty() {
            return Err(Error::WouldBlock);
        }
        let n = max_bytes.min(state.inbox.len());
        let bytes: Vec<u8> = state.inbox.drain(..n).collect();
        if let Some(first) = state.sockets.first().copied() {
            *state.recv.entry(first).or_default() += n as u64;
        }
        Ok(bytes)
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.closed = true;
        state.sockets.clear();
        Ok(())
    }

    fn sent_distribution(&self) -> HashMap<Uuid, u64> {
        self.state.lock().sent.clone()
    }

    fn recv_distribution(&self) -> HashMap<Uuid, u64> {
        self.state.lock().recv.clone()
    }
}

/// A factory whose transports all report into the returned state.
pub fn recording_factory() -> (TransportFactory, Arc<Mutex<TransportState>>) {
    let state = Arc::new(Mutex::new(TransportState::default()));
    let shared = state.clone();
    let factory: TransportFactory =
        Arc::new(move |_config: &MultipathConfig| -> Result<Box<dyn ChunkTransport>> {
            Ok(Box::new(RecordingTransport {
                state: shared.clone(),
            }))
        });
    (factory, state)
}

pub fn fast_config() -> MultipathConfig {
    MultipathConfig::new()
        .with_retry_interval(Duration::from_millis(5))
        .with_retry_connect_timeout(Duration::from_millis(200))
        .with_receive_poll_interval(Duration::from_millis(20))
        .with_accept_poll_interval(Duration::from_millis(5))
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
