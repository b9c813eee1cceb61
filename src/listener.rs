use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::completion::{self, AcceptCompletion};
use crate::config::MultipathConfig;
use crate::ports::logical_port;
use crate::registry::{PathId, PathRegistry};
use crate::stream::MultipathStream;
use crate::table::{ListenerTable, PathConnectionTable};
use crate::transport::TransportFactory;
use crate::{Error, Result};

/// A listener bound on several paths at once, producing [`MultipathStream`]s.
///
/// Created by [`crate::MultipathBinder::listen`].
pub struct MultipathListener {
    table: ListenerTable,
    registry: PathRegistry,
    config: MultipathConfig,
    transport_factory: TransportFactory,
    cancel: CancelToken,
    local: SocketAddr,
    closed: bool,
}

impl MultipathListener {
    pub(crate) fn new(
        table: ListenerTable,
        registry: PathRegistry,
        config: MultipathConfig,
        transport_factory: TransportFactory,
        cancel: CancelToken,
        local: SocketAddr,
    ) -> Self {
        Self {
            table,
            registry,
            config,
            transport_factory,
            cancel,
            local,
            closed: false,
        }
    }

    /// One accept pass over every bound path, in sorted order.
    ///
    /// Returns the remote address and a stream as soon as at least one path
    /// accepted; the remaining paths are accepted in the background. The port
    /// returned is the peer's logical port, with the path offset removed. If no
    /// path had a pending connection the first path error is returned,
    /// typically [`Error::WouldBlock`].
    pub fn accept(&mut self) -> Result<(IpAddr, u16, MultipathStream)> {
        if self.closed {
            return Err(Error::ClosedLocally);
        }
        let base_port = self.local.port();
        let table = PathConnectionTable::new();
        let mut first_err = None;
        let mut first_success = None;
        let mut accepted = 0;

        for (path, entry) in self.table.snapshot() {
            table.insert_pending(&path, 0, entry.local_port);
            let (Some(listener), Some(stack)) = (entry.handle, self.registry.get(&path)) else {
                continue;
            };
            match stack.accept(&listener) {
                Ok((ip, port, handle)) => {
                    table.set_dest_port(&path, port);
                    if let Err(handle) = table.install(&path, handle) {
                        let _ = handle.shutdown();
                        continue;
                    }
                    accepted += 1;
                    let offset = entry.local_port.saturating_sub(base_port) as usize;
                    first_success.get_or_insert((ip, logical_port(port, offset)));
                    log::debug!("Path {path} accepted {ip}:{port}");
                }
                Err(e) => {
                    log::trace!("Path {path} accept: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }

        let Some((remote_ip, remote_port)) = first_success else {
            table.clear();
            return Err(first_err
                .unwrap_or_else(|| Error::Internal("no listener attempted and no error recorded".into())));
        };
        if table.connected_count() != accepted {
            for (_, handle) in table.clear() {
                let _ = handle.shutdown();
            }
            return Err(Error::Internal(format!(
                "{accepted} paths accepted but the table disagrees"
            )));
        }

        let transport = match (self.transport_factory)(&self.config) {
            Ok(transport) => transport,
            Err(e) => {
                for (_, handle) in table.clear() {
                    let _ = handle.shutdown();
                }
                return Err(e);
            }
        };
        let cancel = CancelToken::new();
        let task = AcceptCompletion {
            table: table.clone(),
            listeners: self.table.clone(),
            registry: self.registry.clone(),
        };
        let name = format!("mp-accept-{remote_ip}:{remote_port}");
        if let Err(e) = completion::spawn(
            name,
            task,
            cancel.clone(),
            self.config.retry_interval,
            Default::default(),
        ) {
            log::warn!("Could not start background accept, staying on {accepted} paths: {e}");
        }

        let peer = SocketAddr::new(remote_ip, remote_port);
        log::debug!("Accepted multipath stream from {peer} on {accepted}/{} paths", table.len());
        let stream = MultipathStream::new(table, transport, cancel, self.local, peer);
        Ok((remote_ip, remote_port, stream))
    }

    /// Repeats [`accept`](Self::accept) while it would block, up to `timeout`
    /// (forever with `None`).
    pub fn accept_timeout(&mut self, timeout: Option<Duration>) -> Result<(IpAddr, u16, MultipathStream)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.accept() {
                Err(Error::WouldBlock) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::TimedOut);
                    }
                    thread::sleep(self.config.accept_poll_interval);
                }
                r => return r,
            }
        }
    }

    /// Stops listening on every path. Returns `true` only for the call that closed it.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.cancel.cancel();
        for (path, handle) in self.table.clear() {
            let closed = match self.registry.get(&path) {
                Some(stack) => stack.close_listener(&handle),
                None => {
                    handle.mark_closed();
                    Ok(())
                }
            };
            if let Err(e) = closed {
                log::debug!("Failed to close listener of path {path}: {e}");
            }
        }
        log::debug!("Closed listener on {}", self.local);
        true
    }

    /// Paths with a bound listener, sorted.
    pub fn bound_paths(&self) -> Vec<PathId> {
        self.table.connected().into_iter().map(|(path, _)| path).collect()
    }

    /// The logical local address (the port of the first path).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MultipathListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MultipathListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipathListener")
            .field("local", &self.local)
            .field("paths", &self.table.len())
            .field("bound", &self.table.connected_count())
            .field("closed", &self.closed)
            .finish()
    }
}
