//! Failure taxonomy for the connection layer and both measurement protocols.
//!
//! Every fatal condition carries a distinct process exit code so an operator
//! can tell the failure class from the exit status alone. The library never
//! terminates the process itself; the binary maps a [`NetError`] to its code.

use std::io;

use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::registry::RegistryError;

/// Errors raised by the socket factory, advertiser, locator, acceptor and
/// the protocol clients/servers.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid service identifier {value}: {reason}")]
    InvalidService { value: i64, reason: &'static str },

    #[error("socket creation failed: {0}")]
    Socket(io::Error),

    #[error("bind to {endpoint} failed: {source}")]
    Bind { endpoint: String, source: io::Error },

    #[error("no bindable source port among {attempts} candidates starting at {start}")]
    SourcePortExhausted { start: u16, attempts: u32 },

    #[error("cannot read local vsock context id: {0}")]
    LocalCid(io::Error),

    #[error("listen failed: {0}")]
    Listen(io::Error),

    #[error("failed to register program {program} on port {port}: {source}")]
    Register {
        program: u32,
        port: u32,
        source: RegistryError,
    },

    #[error("cannot resolve host {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("no port registered for program {program} on {host}")]
    NotRegistered { host: String, program: u32 },

    #[error("port lookup for program {program} on {host} failed: {source}")]
    Lookup {
        host: String,
        program: u32,
        source: RegistryError,
    },

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error("connect to {endpoint} failed: {source}")]
    Connect { endpoint: Endpoint, source: io::Error },

    #[error("server {host} unreachable after {attempts} connect attempts")]
    Unreachable { host: String, attempts: u32 },

    #[error("write of {size} bytes failed: {source}")]
    Write { size: usize, source: io::Error },

    #[error("read of {size} bytes failed: {source}")]
    Read { size: usize, source: io::Error },

    #[error("message size {size} outside 1..={max}")]
    MessageSize { size: usize, max: usize },

    #[error("transaction session not established; call setup first")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetError {
    /// Process exit status for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            NetError::Socket(_) => 1,
            NetError::Bind { .. } | NetError::SourcePortExhausted { .. } | NetError::LocalCid(_) => 2,
            NetError::NotRegistered { .. } | NetError::Lookup { .. } => 3,
            NetError::Listen(_) => 4,
            NetError::Register { .. } => 5,
            NetError::Accept(_) => 6,
            NetError::Connect { .. } | NetError::Unreachable { .. } => 7,
            NetError::Resolve { .. } => 8,
            NetError::Write { .. } => 9,
            NetError::Read { .. } => 10,
            NetError::InvalidService { .. } | NetError::MessageSize { .. } | NetError::NotConnected => 64,
            NetError::Io(_) => 70,
        }
    }
}
