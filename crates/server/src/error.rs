//! Error types for the service lifecycle.

use crate::supervisor::Phase;
use std::net::SocketAddr;

/// Errors raised by a [`Listener`](crate::listener::Listener).
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The listener has already released its socket.
    #[error("Listener already closed")]
    AlreadyClosed,

    /// `serve` was called before `bind`.
    #[error("Listener is not bound")]
    NotBound,

    #[error("Listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while starting or driving a lifecycle supervisor.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Another socket is already listening on the configured address.
    #[error("Port {} is already in use (address {addr})", .addr.port())]
    PortInUse { addr: SocketAddr },

    #[error("Could not resolve {host}:{port} to a socket address")]
    Resolve { host: String, port: u16 },

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: ListenerError,
    },

    #[error("Supervisor is in phase {actual:?}, expected {expected:?}")]
    InvalidPhase { expected: Phase, actual: Phase },

    #[error("Failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
