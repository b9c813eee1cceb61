use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::completion::{self, ConnectCompletion};
use crate::config::MultipathConfig;
use crate::ports::spread_port;
use crate::registry::PathRegistry;
use crate::stream::MultipathStream;
use crate::table::PathConnectionTable;
use crate::transport::{TransportFactory, striped_factory};
use crate::{Error, Result};

/// Opens multipath connections over every path of a [`PathRegistry`].
///
/// Paths are tried in sorted order, path `i` connecting from `local_port + i`
/// to `dest_port + i`. The acceptor enumerates its paths the same way, which
/// is how the two ends agree on which connection belongs to which path.
///
/// # Example
///
/// ```rust,no_run
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use multipath_shim::{MultipathConnector, PathRegistry, TcpPathStack};
///
/// let registry = PathRegistry::new();
/// registry.register("eth0", Arc::new(TcpPathStack::new()));
/// registry.register("wlan0", Arc::new(TcpPathStack::new()));
///
/// let connector = MultipathConnector::new(registry);
/// let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
/// let mut stream = connector.connect(localhost, 9000, unspecified, 0, Duration::from_secs(2))?;
/// stream.send(b"hello over two paths")?;
/// # Ok::<(), multipath_shim::Error>(())
/// ```
#[derive(Clone)]
pub struct MultipathConnector {
    registry: PathRegistry,
    config: MultipathConfig,
    transport_factory: TransportFactory,
}

impl MultipathConnector {
    /// A connector over `registry` with default configuration and striped transport.
    pub fn new(registry: PathRegistry) -> Self {
        Self {
            registry,
            config: MultipathConfig::default(),
            transport_factory: striped_factory(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: MultipathConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the chunk transport used by new streams.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// The registry this connector reads its paths from.
    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Connects every path once and returns as soon as at least one succeeded.
    ///
    /// `timeout` bounds each attempt of this first pass only; failed paths are
    /// retried in the background. If no path connects, the error of the first
    /// failing path in sorted order is returned.
    pub fn connect(
        &self,
        dest_ip: IpAddr,
        dest_port: u16,
        local_ip: IpAddr,
        local_port: u16,
        timeout: Duration,
    ) -> Result<MultipathStream> {
        self.config.validate()?;
        let table = PathConnectionTable::new();
        let mut abandoned = HashSet::new();
        let mut first_err = None;
        let mut connected = 0;

        for (ordinal, (path, stack)) in self.registry.snapshot().into_iter().enumerate() {
            let ports = spread_port(dest_port, ordinal)
                .and_then(|d| spread_port(local_port, ordinal).map(|l| (d, l)));
            let (path_dest, path_local) = match ports {
                Ok(ports) => ports,
                Err(e) => {
                    log::warn!("Path {path} cannot be used: {e}");
                    abandoned.insert(path);
                    first_err.get_or_insert(e);
                    continue;
                }
            };
            table.insert_pending(&path, path_dest, path_local);

            log::debug!("Connecting path {path} to {dest_ip}:{path_dest} from port {path_local}");
            match stack.open_connection(dest_ip, path_dest, local_ip, path_local, timeout) {
                Ok(handle) => match table.install(&path, handle) {
                    Ok(()) => connected += 1,
                    Err(handle) => {
                        let _ = handle.shutdown();
                        shutdown_all(&table);
                        return Err(Error::Internal(format!("path {path} connected twice")));
                    }
                },
                Err(e) => {
                    log::debug!("Path {path} failed: {e}");
                    if matches!(e, Error::ClosedLocally) {
                        table.abandon(&path);
                        abandoned.insert(path);
                    }
                    first_err.get_or_insert(e);
                }
            }
        }

        if connected == 0 {
            table.clear();
            return Err(first_err
                .unwrap_or_else(|| Error::Internal("no path attempted and no error recorded".into())));
        }
        if table.connected_count() != connected {
            shutdown_all(&table);
            return Err(Error::Internal(format!(
                "{connected} paths connected but the table disagrees"
            )));
        }
        log::debug!("{connected}/{} paths connected to {dest_ip}:{dest_port}", table.len());

        let cancel = CancelToken::new();
        let transport = match (self.transport_factory)(&self.config) {
            Ok(transport) => transport,
            Err(e) => {
                shutdown_all(&table);
                return Err(e);
            }
        };
        let task = ConnectCompletion {
            table: table.clone(),
            registry: self.registry.clone(),
            dest_ip,
            dest_port,
            local_ip,
            local_port,
            timeout: self.config.retry_connect_timeout,
        };
        let name = format!("mp-connect-{dest_ip}:{dest_port}");
        if let Err(e) = completion::spawn(name, task, cancel.clone(), self.config.retry_interval, abandoned) {
            log::warn!("Could not start background connect, staying on {connected} paths: {e}");
        }

        Ok(MultipathStream::new(
            table,
            transport,
            cancel,
            SocketAddr::new(local_ip, local_port),
            SocketAddr::new(dest_ip, dest_port),
        ))
    }
}

fn shutdown_all(table: &PathConnectionTable) {
    for (_, handle) in table.clear() {
        let _ = handle.shutdown();
    }
}
