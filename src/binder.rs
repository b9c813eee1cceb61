use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::cancel::CancelToken;
use crate::completion::{self, ListenCompletion};
use crate::config::MultipathConfig;
use crate::listener::MultipathListener;
use crate::ports::spread_port;
use crate::registry::PathRegistry;
use crate::table::ListenerTable;
use crate::transport::{TransportFactory, striped_factory};
use crate::{Error, Result};

/// Binds multipath listeners over every path of a [`PathRegistry`].
///
/// Path `i` in sorted order listens on `local_port + i`, matching the ports a
/// [`crate::MultipathConnector`] with the same path names connects to.
///
/// # Example
///
/// ```rust,no_run
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
/// use multipath_shim::{MultipathBinder, PathRegistry, TcpPathStack};
///
/// let registry = PathRegistry::new();
/// registry.register("eth0", Arc::new(TcpPathStack::new()));
/// registry.register("wlan0", Arc::new(TcpPathStack::new()));
///
/// let mut listener = MultipathBinder::new(registry).listen(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000)?;
/// let (ip, port, mut stream) = listener.accept_timeout(None)?;
/// println!("Accepted multipath connection from {ip}:{port}");
/// let greeting = stream.receive(1024)?;
/// # Ok::<(), multipath_shim::Error>(())
/// ```
#[derive(Clone)]
pub struct MultipathBinder {
    registry: PathRegistry,
    config: MultipathConfig,
    transport_factory: TransportFactory,
}

impl MultipathBinder {
    /// A binder over `registry` with default configuration and striped transport.
    pub fn new(registry: PathRegistry) -> Self {
        Self {
            registry,
            config: MultipathConfig::default(),
            transport_factory: striped_factory(),
        }
    }

    /// Replaces the configuration handed to listeners and accepted streams.
    pub fn with_config(mut self, config: MultipathConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the chunk transport used by accepted streams.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Listens on every path once and returns as soon as at least one is bound.
    ///
    /// Paths that failed to bind keep being retried in the background. If no
    /// path could be bound, the error of the first failing path in sorted order
    /// is returned.
    pub fn listen(&self, local_ip: IpAddr, local_port: u16) -> Result<MultipathListener> {
        self.config.validate()?;
        let table = ListenerTable::new();
        let mut abandoned = HashSet::new();
        let mut first_err = None;
        let mut bound = 0;

        for (ordinal, (path, stack)) in self.registry.snapshot().into_iter().enumerate() {
            let port = match spread_port(local_port, ordinal) {
                Ok(port) => port,
                Err(e) => {
                    log::warn!("Path {path} cannot listen: {e}");
                    abandoned.insert(path);
                    first_err.get_or_insert(e);
                    continue;
                }
            };
            table.insert_pending(&path, 0, port);

            match stack.listen_for_connection(local_ip, port) {
                Ok(handle) => match table.install(&path, handle) {
                    Ok(()) => bound += 1,
                    Err(handle) => {
                        let _ = stack.close_listener(&handle);
                        close_all(&table, &self.registry);
                        return Err(Error::Internal(format!("path {path} bound twice")));
                    }
                },
                Err(e) => {
                    log::debug!("Path {path} could not listen on {local_ip}:{port}: {e}");
                    if matches!(e, Error::ClosedLocally) {
                        table.abandon(&path);
                        abandoned.insert(path);
                    }
                    first_err.get_or_insert(e);
                }
            }
        }

        if bound == 0 {
            table.clear();
            return Err(first_err
                .unwrap_or_else(|| Error::Internal("no path attempted and no error recorded".into())));
        }
        log::debug!("{bound}/{} paths listening on {local_ip}:{local_port}", table.len());

        let cancel = CancelToken::new();
        let task = ListenCompletion {
            table: table.clone(),
            registry: self.registry.clone(),
            local_ip,
            local_port,
        };
        let name = format!("mp-listen-{local_ip}:{local_port}");
        if let Err(e) = completion::spawn(name, task, cancel.clone(), self.config.retry_interval, abandoned) {
            log::warn!("Could not start background listen, staying on {bound} paths: {e}");
        }

        Ok(MultipathListener::new(
            table,
            self.registry.clone(),
            self.config.clone(),
            self.transport_factory.clone(),
            cancel,
            SocketAddr::new(local_ip, local_port),
        ))
    }
}

fn close_all(table: &ListenerTable, registry: &PathRegistry) {
    for (path, handle) in table.clear() {
        match registry.get(&path) {
            Some(stack) => {
                let _ = stack.close_listener(&handle);
            }
            None => {
                handle.mark_closed();
            }
        }
    }
}
