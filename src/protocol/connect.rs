//! Connection-cost protocol.
//!
//! The server accepts connections strictly one at a time and reads at most
//! one byte from each. A connection closed without data is just closed; any
//! byte received is the shutdown request. The client measures a fresh
//! connect plus close per iteration; sockets are never reused.

use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::acceptor::Listener;
use crate::advertise::{advertise, Advertisement, ListenOptions};
use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::harness::Benchmark;
use crate::locator::{ServiceLocator, MAX_CONNECT_RETRIES};
use crate::registry::PortRegistry;
use crate::service::ServiceId;
use crate::socket::SockOpts;

use super::{withdraw, StopReason};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct ConnectServer {
    listener: Listener,
    advertisement: Advertisement,
}

impl ConnectServer {
    /// Advertise the service and register the listener with the runtime.
    /// Accepted connections are left untuned.
    pub fn bind(options: &ListenOptions, registry: Arc<dyn PortRegistry>) -> Result<Self, NetError> {
        let (socket, advertisement) = advertise(options, registry)?;
        let listener = match Listener::new(socket, SockOpts::NONE) {
            Ok(listener) => listener,
            Err(e) => {
                advertisement.withdraw();
                return Err(e);
            }
        };
        Ok(Self {
            listener,
            advertisement,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.advertisement.endpoint()
    }

    /// Serve until a client sends the shutdown byte or `shutdown` is
    /// cancelled. The service is withdrawn on every exit path.
    pub async fn run(self, shutdown: CancellationToken) -> Result<StopReason, NetError> {
        let result = self.serve(&shutdown).await;
        withdraw(&self.advertisement).await;
        match &result {
            Ok(reason) => info!(endpoint = %self.endpoint(), %reason, "connect server stopped"),
            Err(e) => debug!(error = %e, "connect server failed"),
        }
        result
    }

    async fn serve(&self, shutdown: &CancellationToken) -> Result<StopReason, NetError> {
        let mut connections: u64 = 0;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = self.listener.accept() => Some(result),
            };
            let Some(conn) = accepted.transpose()? else {
                return Ok(StopReason::Interrupted);
            };
            connections += 1;

            let mut byte = [0u8; 1];
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = conn.read(&mut byte) => Some(result),
            };
            match read {
                None => return Ok(StopReason::Interrupted),
                Some(Ok(n)) if n > 0 => {
                    info!(peer = ?conn.peer(), connections, "shutdown byte received");
                    return Ok(StopReason::Requested);
                }
                Some(Ok(_)) => trace!(peer = ?conn.peer(), "connection closed by peer"),
                // a reset connection carries no request
                Some(Err(e)) => trace!(peer = ?conn.peer(), error = %e, "connection read failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Measures connect plus close against a connection-cost server.
pub struct ConnectClient {
    locator: ServiceLocator,
    host: String,
    service: ServiceId,
}

impl ConnectClient {
    pub fn new(locator: ServiceLocator, host: impl Into<String>, service: ServiceId) -> Self {
        Self {
            locator,
            host: host.into(),
            service,
        }
    }

    pub fn label(&self) -> String {
        format!("TCP/IP connection cost to {}", self.host)
    }
}

impl Benchmark for ConnectClient {
    fn run(&mut self, iterations: u64) -> Result<(), NetError> {
        for _ in 0..iterations {
            match self.locator.connect(&self.host, self.service, SockOpts::REUSE)? {
                Some(socket) => drop(socket),
                None => return Err(unreachable(&self.host)),
            }
        }
        Ok(())
    }
}

/// Ask the connection-cost server on `host` to stop: connect and send one
/// byte.
pub fn request_shutdown(
    locator: &mut ServiceLocator,
    host: &str,
    service: ServiceId,
) -> Result<(), NetError> {
    let mut socket = locator
        .connect(host, service, SockOpts::NONE)?
        .ok_or_else(|| unreachable(host))?;
    socket
        .write_all(b"0")
        .map_err(|source| NetError::Write { size: 1, source })?;
    debug!(%host, %service, "connect server shutdown requested");
    Ok(())
}

fn unreachable(host: &str) -> NetError {
    NetError::Unreachable {
        host: host.to_string(),
        attempts: MAX_CONNECT_RETRIES + 1,
    }
}
