//! # Multipath Shim - Connections Spread Over Several Paths
//!
//! Multipath Shim is a Rust library that turns one logical connection request
//! into several independently established connections ("paths") and presents
//! them as a single socket. Traffic is striped across every path that is up,
//! so congestion or failure on one route, interface or lower stack hurts the
//! logical connection less.
//!
//! ## Key Features
//!
//! - **Partial-failure tolerant setup**: `connect` and `listen` succeed as soon
//!   as one path does; the rest keep being retried in the background
//! - **Non-blocking completion**: late paths join the live stream on its next
//!   send or receive, without the caller waiting for them
//! - **Deterministic pairing**: both endpoints sort their path names and use
//!   `port + i` for path `i`, so path `i` on one side meets path `i` on the other
//! - **Pluggable paths**: anything implementing [`PathStack`] can be a path;
//!   [`TcpPathStack`] covers plain TCP, optionally pinned to an interface
//! - **Per-path accounting**: [`MultipathStream::stats`] reports the bytes each
//!   path carried
//!
//! ## How It Works
//!
//! A [`PathRegistry`] names the configured paths. A [`MultipathConnector`] (or a
//! [`MultipathBinder`] on the accepting side) makes one synchronous pass over
//! them in sorted order, records which succeeded in a shared connection table,
//! starts a background thread for the rest and returns a [`MultipathStream`]
//! (or [`MultipathListener`]). The stream owns a [`ChunkTransport`], by default
//! a [`StripedTransport`], which cuts every message into sequenced fragments
//! and writes them round-robin over the registered path sockets.
//!
//! ## Basic Usage
//!
//! ### Server Side
//!
//! ```rust,no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use multipath_shim::{MultipathBinder, PathRegistry, TcpPathStack};
//!
//! let registry = PathRegistry::new();
//! for name in ["path-0", "path-1", "path-2"] {
//!     registry.register(name, Arc::new(TcpPathStack::new()));
//! }
//!
//! // Listens on 8080, 8081 and 8082
//! let mut listener = MultipathBinder::new(registry).listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)?;
//! loop {
//!     let (ip, port, mut stream) = listener.accept_timeout(None)?;
//!     println!("Accepted multipath connection from {ip}:{port}");
//!     let data = stream.receive(1024)?;
//!     stream.send(&data)?;
//! }
//! # Ok::<(), multipath_shim::Error>(())
//! ```
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use multipath_shim::{MultipathConnector, PathRegistry, TcpPathStack};
//!
//! let registry = PathRegistry::new();
//! for name in ["path-0", "path-1", "path-2"] {
//!     registry.register(name, Arc::new(TcpPathStack::new()));
//! }
//!
//! let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
//! let mut stream = MultipathConnector::new(registry)
//!     .connect(localhost, 8080, localhost, 0, Duration::from_secs(2))?;
//! stream.send(b"Hello from every path!")?;
//! let response = stream.receive(1024)?;
//! println!("Response: {}", String::from_utf8_lossy(&response));
//! # Ok::<(), multipath_shim::Error>(())
//! ```
//!
//! ## Configuration
//!
//! [`MultipathConfig`] controls the background retry cadence, the connect
//! timeout of background retries, the receive poll interval and the fragment
//! size used by the striped transport.
//!
//! ## Limitations
//!
//! - Port spreading uses `port .. port + N - 1`; anything else bound there
//!   collides with the multipath connection
//! - Both endpoints must register the same path names for the pairing to line up
//! - The set of paths can grow while a connection is live but never shrinks

#![warn(missing_docs)]

mod binder;
mod cancel;
mod completion;
mod config;
mod connector;
mod error;
mod handle;
mod listener;
mod ports;
mod registry;
mod stack;
mod stream;
mod table;
mod transport;

pub use binder::MultipathBinder;
pub use cancel::CancelToken;
pub use config::{DEFAULT_FRAGMENT_SIZE, DEFAULT_MAX_FRAME_LEN, MultipathConfig};
pub use connector::MultipathConnector;
pub use error::{Error, Result};
pub use handle::{ListenerHandle, SocketHandle};
pub use listener::MultipathListener;
pub use ports::{logical_port, spread_port};
pub use registry::{PathId, PathRegistry};
pub use stack::{PathStack, TcpPathStack};
pub use stream::{MultipathStream, PathStats};
pub use table::{ListenerTable, PathConnectionTable, PathEntry, PathTable};
pub use transport::{ChunkTransport, StripedTransport, TransportFactory, striped_factory};
