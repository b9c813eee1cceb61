//! The per-path transport a multipath aggregate fans out over.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::handle::{ListenerHandle, SocketHandle};
use crate::{Error, Result};

const LISTEN_BACKLOG: i32 = 128;

/// One independently established transport path.
///
/// Implementations may route over a distinct interface, a distinct lower
/// stack, or anything else that yields TCP streams. `accept` must not block:
/// with no pending connection it returns [`Error::WouldBlock`].
pub trait PathStack: Send + Sync {
    /// Opens a connection from `local_ip:local_port` to `dest_ip:dest_port`.
    fn open_connection(
        &self,
        dest_ip: IpAddr,
        dest_port: u16,
        local_ip: IpAddr,
        local_port: u16,
        timeout: Duration,
    ) -> Result<SocketHandle>;

    /// Starts listening on `local_ip:local_port`.
    fn listen_for_connection(&self, local_ip: IpAddr, local_port: u16) -> Result<ListenerHandle>;

    /// Accepts one pending connection, returning the remote address and the stream.
    fn accept(&self, listener: &ListenerHandle) -> Result<(IpAddr, u16, SocketHandle)>;

    /// Stops listening. Accepting on the handle afterwards yields [`Error::ClosedLocally`].
    fn close_listener(&self, listener: &ListenerHandle) -> Result<()> {
        listener.mark_closed();
        Ok(())
    }
}

/// A path made of plain TCP, optionally pinned to one local interface.
#[derive(Debug, Default)]
pub struct TcpPathStack {
    local_ip: Option<IpAddr>,
    listening: Mutex<HashSet<SocketAddr>>,
}

impl TcpPathStack {
    /// A stack that binds to whatever local IP the caller asks for.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack that always binds to `ip`, so its traffic leaves through that interface.
    pub fn with_local_ip(ip: IpAddr) -> Self {
        Self {
            local_ip: Some(ip),
            listening: Mutex::new(HashSet::new()),
        }
    }

    fn local_addr(&self, local_ip: IpAddr, local_port: u16) -> SocketAddr {
        SocketAddr::new(self.local_ip.unwrap_or(local_ip), local_port)
    }
}

fn bind_error(addr: SocketAddr, err: std::io::Error) -> Error {
    match Error::from(err) {
        Error::Io(e) => Error::AddressBinding(format!("{addr}: {e}")),
        other => other,
    }
}

impl PathStack for TcpPathStack {
    fn open_connection(
        &self,
        dest_ip: IpAddr,
        dest_port: u16,
        local_ip: IpAddr,
        local_port: u16,
        timeout: Duration,
    ) -> Result<SocketHandle> {
        let dest = SocketAddr::new(dest_ip, dest_port);
        let local = self.local_addr(local_ip, local_port);
        let socket = Socket::new(Domain::for_address(dest), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if !(local.ip().is_unspecified() && local.port() == 0) {
            socket.bind(&local.into()).map_err(|e| bind_error(local, e))?;
        }
        log::trace!("Connecting {local} -> {dest}");
        socket.connect_timeout(&dest.into(), timeout)?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(SocketHandle::new(stream))
    }

    fn listen_for_connection(&self, local_ip: IpAddr, local_port: u16) -> Result<ListenerHandle> {
        let local = self.local_addr(local_ip, local_port);
        let mut listening = self.listening.lock();
        if listening.contains(&local) {
            return Err(Error::AlreadyListening);
        }
        let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into()).map_err(|e| bind_error(local, e))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        let bound = listener.local_addr()?;
        listening.insert(bound);
        log::debug!("Listening on {bound}");
        Ok(ListenerHandle::new(listener))
    }

    fn accept(&self, listener: &ListenerHandle) -> Result<(IpAddr, u16, SocketHandle)> {
        if listener.is_closed() {
            return Err(Error::ClosedLocally);
        }
        let (stream, addr) = listener.listener().accept()?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        log::debug!("Accepted connection from: {addr}");
        Ok((addr.ip(), addr.port(), SocketHandle::new(stream)))
    }

    fn close_listener(&self, listener: &ListenerHandle) -> Result<()> {
        if listener.mark_closed() {
            if let Ok(addr) = listener.local_addr() {
                self.listening.lock().remove(&addr);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn accept_without_pending_would_block() {
        let stack = TcpPathStack::new();
        let listener = stack.listen_for_connection(LOOPBACK, 0).unwrap();
        assert!(matches!(stack.accept(&listener), Err(Error::WouldBlock)));
    }

    #[test]
    fn connect_and_accept_over_loopback() {
        let stack = TcpPathStack::new();
        let listener = stack.listen_for_connection(LOOPBACK, 0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = stack
            .open_connection(LOOPBACK, port, LOOPBACK, 0, Duration::from_secs(2))
            .unwrap();

        let mut accepted = None;
        for _ in 0..200 {
            match stack.accept(&listener) {
                Ok(r) => {
                    accepted = Some(r);
                    break;
                }
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (ip, remote_port, _server) = accepted.expect("no connection accepted");
        assert_eq!(ip, LOOPBACK);
        assert_eq!(remote_port, client.local_addr().unwrap().port());
    }

    #[test]
    fn second_listen_on_same_address_is_rejected() {
        let stack = TcpPathStack::new();
        let listener = stack.listen_for_connection(LOOPBACK, 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(matches!(
            stack.listen_for_connection(LOOPBACK, port),
            Err(Error::AlreadyListening)
        ));
    }

    #[test]
    fn accept_after_close_reports_closed_locally() {
        let stack = TcpPathStack::new();
        let listener = stack.listen_for_connection(LOOPBACK, 0).unwrap();
        stack.close_listener(&listener).unwrap();
        assert!(matches!(stack.accept(&listener), Err(Error::ClosedLocally)));
    }
}
