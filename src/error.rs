//! Error kinds surfaced by path stacks, chunk transports and the aggregates built on them.

use std::io;

use thiserror::Error;

/// Errors produced by multipath operations.
///
/// The variants mirror the failure kinds a single path can report. When every
/// path of a connect, listen or accept pass fails, the caller receives the
/// first concrete per-path error rather than a generic aggregate failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation would block; try again later.
    #[error("operation would block")]
    WouldBlock,

    /// The operation did not complete within its timeout.
    #[error("operation timed out")]
    TimedOut,

    /// The remote end refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The local address could not be bound.
    #[error("failed to bind address: {0}")]
    AddressBinding(String),

    /// The address or connection tuple is already in use.
    #[error("address already in use")]
    AddressInUse,

    /// The path is already listening on that address.
    #[error("already listening on this address")]
    AlreadyListening,

    /// A system resource (descriptors, buffers, threads) ran out.
    #[error("resources exhausted")]
    ResourceExhausted,

    /// The socket or listener was closed locally.
    #[error("socket closed locally")]
    ClosedLocally,

    /// The remote end closed the connection.
    #[error("socket closed by remote peer")]
    ClosedRemotely,

    /// The network is unreachable.
    #[error("network connectivity is down")]
    ConnectivityDown,

    /// An internal invariant did not hold.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Frame header could not be encoded.
    #[error("frame encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Frame header could not be decoded or was out of bounds.
    #[error("frame decode error: {0}")]
    Codec(String),

    /// Any other I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl Error {
    /// Errors the background completion tasks treat as "try again on the next pass".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::WouldBlock | Error::ResourceExhausted | Error::AlreadyListening | Error::AddressInUse
        )
    }

    /// Errors meaning the whole aggregate can no longer carry data.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ClosedLocally | Error::ClosedRemotely)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            WouldBlock => Error::WouldBlock,
            TimedOut => Error::TimedOut,
            ConnectionRefused => Error::ConnectionRefused,
            AddrInUse => Error::AddressInUse,
            AddrNotAvailable => Error::AddressBinding(err.to_string()),
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected => {
                Error::ClosedRemotely
            }
            NetworkUnreachable | HostUnreachable | NetworkDown => Error::ConnectivityDown,
            OutOfMemory => Error::ResourceExhausted,
            _ => Error::Io(err),
        }
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(e) => return io::Error::new(e.kind(), err.to_string()),
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::TimedOut => io::ErrorKind::TimedOut,
            Error::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Error::AddressBinding(_) => io::ErrorKind::AddrNotAvailable,
            Error::AddressInUse | Error::AlreadyListening => io::ErrorKind::AddrInUse,
            Error::ResourceExhausted => io::ErrorKind::OutOfMemory,
            Error::ClosedLocally => io::ErrorKind::NotConnected,
            Error::ClosedRemotely => io::ErrorKind::ConnectionReset,
            Error::ConnectivityDown => io::ErrorKind::NetworkUnreachable,
            Error::Config(_) => io::ErrorKind::InvalidInput,
            Error::Encode(_) | Error::Codec(_) => io::ErrorKind::InvalidData,
            Error::Internal(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
