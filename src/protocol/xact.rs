//! Transaction-latency protocol.
//!
//! Wire format: after connecting, the client sends the message size as a
//! 4-byte big-endian integer, once. Each transaction is then `size` bytes
//! written by the client and echoed back by the server. A client that
//! connects and closes without sending the header asks the server to stop.
//!
//! Every accepted connection is owned by its own handler task. The listener
//! reaps finished handlers as they complete and stops accepting as soon as
//! one of them reports a shutdown request; the other sessions are left to
//! finish on their own.

use std::io::{Read, Write};
use std::sync::Arc;

use socket2::Socket;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::acceptor::{Connection, Listener};
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
// Constants
// ---------------------------------------------------------------------------

/// Size of the message-size header.
pub const HEADER_LEN: usize = 4;

/// Largest message size a handler will allocate for: 64 MiB.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// How a per-connection handler ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The peer closed after the echo loop; `bytes` were echoed.
    Closed { bytes: u64 },
    /// The peer closed without sending a header.
    ShutdownRequested,
    /// Protocol or I/O error; the connection was dropped.
    Dropped(&'static str),
}

/// Serve one connection: read the size header, then echo until EOF.
pub async fn handle_connection(conn: Connection) -> HandlerOutcome {
    let peer = conn.peer();
    let mut header = [0u8; HEADER_LEN];
    let received = match conn.read_full(&mut header).await {
        Ok(n) => n,
        Err(e) => {
            debug!(?peer, error = %e, "size header read failed");
            return HandlerOutcome::Dropped("size header read failed");
        }
    };
    match received {
        0 => return HandlerOutcome::ShutdownRequested,
        n if n < HEADER_LEN => return HandlerOutcome::Dropped("truncated size header"),
        _ => {}
    }

    let size = u32::from_be_bytes(header) as usize;
    if size == 0 || size > MAX_MESSAGE_SIZE {
        debug!(?peer, size, "message size out of range");
        return HandlerOutcome::Dropped("message size out of range");
    }
    trace!(?peer, size, "echo loop started");

    let mut buf = vec![0u8; size];
    let mut bytes = 0u64;
    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?peer, error = %e, "echo read failed");
                return HandlerOutcome::Dropped("echo read failed");
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]).await {
            debug!(?peer, error = %e, "echo write failed");
            return HandlerOutcome::Dropped("echo write failed");
        }
        bytes += n as u64;
    }
    HandlerOutcome::Closed { bytes }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct XactServer {
    listener: Listener,
    advertisement: Advertisement,
}

impl XactServer {
    /// Advertise the service and register the listener with the runtime.
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

    /// Accept and hand off connections until a handler sees a shutdown
    /// request or `shutdown` is cancelled.
    ///
    /// On a shutdown request the listener closes at once and sessions still
    /// in progress run until their peers close; cancelling `shutdown` during
    /// that drain, or cancelling it instead of a request, aborts them.
    pub async fn run(self, shutdown: CancellationToken) -> Result<StopReason, NetError> {
        let XactServer {
            listener,
            advertisement,
        } = self;
        // cancelled by a handler on a shutdown request, or by the caller
        let stop = shutdown.child_token();
        let mut handlers = JoinSet::new();
        let mut accepted: u64 = 0;

        let result = loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    break Ok(if shutdown.is_cancelled() {
                        StopReason::Interrupted
                    } else {
                        StopReason::Requested
                    });
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => reap(joined),
                conn = listener.accept() => match conn {
                    Ok(conn) => {
                        accepted += 1;
                        let ad = advertisement.clone();
                        let stop = stop.clone();
                        handlers.spawn(async move {
                            let outcome = handle_connection(conn).await;
                            if outcome == HandlerOutcome::ShutdownRequested {
                                withdraw(&ad).await;
                                stop.cancel();
                            }
                            outcome
                        });
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        // new connections are refused from here on
        drop(listener);
        let in_flight = handlers.len();
        let mut aborted = 0;
        if matches!(result, Ok(StopReason::Requested)) {
            if in_flight > 0 {
                info!(in_flight, "listener closed, waiting for open sessions");
            }
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        aborted = handlers.len();
                        handlers.shutdown().await;
                        break;
                    }
                    joined = handlers.join_next() => match joined {
                        Some(joined) => reap(joined),
                        None => break,
                    },
                }
            }
        } else {
            aborted = in_flight;
            handlers.shutdown().await;
            withdraw(&advertisement).await;
        }

        match &result {
            Ok(reason) => info!(
                endpoint = %advertisement.endpoint(),
                %reason,
                accepted,
                aborted,
                "transaction server stopped"
            ),
            Err(e) => debug!(error = %e, "transaction server failed"),
        }
        result
    }
}

fn reap(joined: Result<HandlerOutcome, JoinError>) {
    match joined {
        Ok(HandlerOutcome::Closed { bytes }) => trace!(bytes, "handler finished"),
        Ok(HandlerOutcome::ShutdownRequested) => debug!("handler received shutdown request"),
        Ok(HandlerOutcome::Dropped(reason)) => debug!(reason, "handler dropped connection"),
        Err(e) if e.is_panic() => warn!(error = %e, "handler panicked"),
        Err(e) => trace!(error = %e, "handler cancelled"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Session {
    socket: Socket,
    buf: Vec<u8>,
}

/// One persistent connection to a transaction server; each timed operation
/// is a full write of `size` bytes followed by reading `size` bytes back.
pub struct XactClient {
    locator: ServiceLocator,
    host: String,
    service: ServiceId,
    size: usize,
    fill: u8,
    session: Option<Session>,
}

impl XactClient {
    pub fn new(
        locator: ServiceLocator,
        host: impl Into<String>,
        service: ServiceId,
        size: usize,
    ) -> Result<Self, NetError> {
        if size == 0 || size > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageSize {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self {
            locator,
            host: host.into(),
            service,
            size,
            fill: 0,
            session: None,
        })
    }

    /// Byte value the payload starts out with.
    pub fn with_fill(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    pub fn label(&self) -> String {
        format!("TCP latency using {}", self.host)
    }

    /// One transaction on the established session; returns the bytes the
    /// server sent back.
    pub fn transact(&mut self) -> Result<&[u8], NetError> {
        let size = self.size;
        let Session { socket, buf } = self.session.as_mut().ok_or(NetError::NotConnected)?;
        socket
            .write_all(buf)
            .map_err(|source| NetError::Write { size, source })?;
        socket
            .read_exact(buf)
            .map_err(|source| NetError::Read { size, source })?;
        Ok(buf)
    }
}

impl Benchmark for XactClient {
    fn setup(&mut self) -> Result<(), NetError> {
        let mut socket = self
            .locator
            .connect(&self.host, self.service, SockOpts::NONE)?
            .ok_or_else(|| unreachable(&self.host))?;
        let header = (self.size as u32).to_be_bytes();
        socket.write_all(&header).map_err(|source| NetError::Write {
            size: HEADER_LEN,
            source,
        })?;
        debug!(host = %self.host, size = self.size, "transaction session established");
        self.session = Some(Session {
            socket,
            buf: vec![self.fill; self.size],
        });
        Ok(())
    }

    fn run(&mut self, iterations: u64) -> Result<(), NetError> {
        for _ in 0..iterations {
            self.transact()?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.session = None;
    }
}

/// Ask the transaction server on `host` to stop: connect and close without
/// sending the size header.
pub fn request_shutdown(
    locator: &mut ServiceLocator,
    host: &str,
    service: ServiceId,
) -> Result<(), NetError> {
    let socket = locator
        .connect(host, service, SockOpts::NONE)?
        .ok_or_else(|| unreachable(host))?;
    drop(socket);
    debug!(%host, %service, "transaction server shutdown requested");
    Ok(())
}

fn unreachable(host: &str) -> NetError {
    NetError::Unreachable {
        host: host.to_string(),
        attempts: MAX_CONNECT_RETRIES + 1,
    }
}
