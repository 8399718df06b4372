//! Service locator: resolves a (host, service) pair to an endpoint and
//! connects with bounded retry.
//!
//! Resolution results are kept in a single-slot cache so that repeated
//! connects to the same service (the connection-cost benchmark reconnects on
//! every iteration) never pay for a naming-service round trip inside the
//! timed region. The locator is owned by one client session and is not
//! meant to be shared between concurrent clients.

use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Arc;

use socket2::Socket;
use tracing::{debug, trace};

use crate::endpoint::{Endpoint, Transport};
use crate::error::NetError;
use crate::registry::{PortRegistry, RegistryError};
use crate::service::{PortSource, ServiceId};
use crate::socket::{create_socket, tune_socket, SockOpts};

/// Transient connect failures tolerated before giving up.
pub const MAX_CONNECT_RETRIES: u32 = 10;

/// Candidate ports tried when binding a pid-derived source port.
const MAX_SOURCE_PORT_CANDIDATES: u32 = 4096;

const FIRST_UNPRIVILEGED_PORT: u16 = 1024;

#[derive(Debug, Clone)]
struct CachedResolution {
    host: String,
    service: ServiceId,
    endpoint: Endpoint,
}

/// Client-side connection factory for one benchmark session.
pub struct ServiceLocator {
    transport: Transport,
    registry: Arc<dyn PortRegistry>,
    cache: Option<CachedResolution>,
    retries: u32,
    last_attempts: u32,
    last_source_port: Option<u16>,
}

impl ServiceLocator {
    pub fn new(transport: Transport, registry: Arc<dyn PortRegistry>) -> Self {
        Self {
            transport,
            registry,
            cache: None,
            retries: 0,
            last_attempts: 0,
            last_source_port: None,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Transient failures seen since the last successful connect.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// `connect(2)` calls made by the most recent [`connect`](Self::connect).
    pub fn last_attempts(&self) -> u32 {
        self.last_attempts
    }

    /// Connect to `service` on `host`.
    ///
    /// Connection refused/reset and `EAGAIN` are retried on a fresh socket;
    /// after [`MAX_CONNECT_RETRIES`] retries the call returns `Ok(None)` and
    /// the counter starts over. Any other failure is an error.
    pub fn connect(
        &mut self,
        host: &str,
        service: ServiceId,
        opts: SockOpts,
    ) -> Result<Option<Socket>, NetError> {
        self.last_attempts = 0;
        loop {
            let socket = create_socket(self.transport.family())?;
            if opts.contains(SockOpts::PID) {
                self.bind_source_port(&socket)?;
            }
            tune_socket(&socket, opts);

            let endpoint = self.resolve(host, service)?;
            self.last_attempts += 1;
            match socket.connect(&endpoint.to_sock_addr()) {
                Ok(()) => {
                    self.retries = 0;
                    return Ok(Some(socket));
                }
                Err(e) if is_transient(&e) => {
                    drop(socket);
                    self.retries += 1;
                    if self.retries > MAX_CONNECT_RETRIES {
                        debug!(%endpoint, attempts = self.last_attempts, error = %e, "giving up on connect");
                        self.retries = 0;
                        return Ok(None);
                    }
                    trace!(%endpoint, retry = self.retries, error = %e, "transient connect failure");
                }
                Err(source) => return Err(NetError::Connect { endpoint, source }),
            }
        }
    }

    /// Endpoint for (`host`, `service`), from the cache when both match the
    /// previous call.
    pub fn resolve(&mut self, host: &str, service: ServiceId) -> Result<Endpoint, NetError> {
        if let Some(cached) = &self.cache {
            if cached.host == host && cached.service == service {
                return Ok(cached.endpoint);
            }
        }

        let endpoint = match service.source() {
            PortSource::Fixed(port) => {
                let ip = match self.transport {
                    Transport::Inet => resolve_host(host)?,
                    // the context id names the peer; the host is not needed
                    Transport::Vsock { .. } => Ipv4Addr::UNSPECIFIED,
                };
                self.transport.peer_endpoint(ip, u32::from(port))
            }
            PortSource::Program(program) => {
                let ip = resolve_host(host)?;
                let port = self.lookup_port(host, ip, program)?;
                self.transport.peer_endpoint(ip, port)
            }
        };

        debug!(%host, %service, %endpoint, "service resolved");
        self.cache = Some(CachedResolution {
            host: host.to_string(),
            service,
            endpoint,
        });
        Ok(endpoint)
    }

    fn lookup_port(&self, host: &str, ip: Ipv4Addr, program: u32) -> Result<u32, NetError> {
        let port = self
            .registry
            .lookup(ip, program)
            .map_err(|source| NetError::Lookup {
                host: host.to_string(),
                program,
                source,
            })?
            .ok_or_else(|| NetError::NotRegistered {
                host: host.to_string(),
                program,
            })?;
        if matches!(self.transport, Transport::Inet) && port > u32::from(u16::MAX) {
            return Err(NetError::Lookup {
                host: host.to_string(),
                program,
                source: RegistryError::Malformed("registered port exceeds 16 bits"),
            });
        }
        Ok(port)
    }

    /// Bind `socket` to the next free port after the last one used, starting
    /// from a port derived from the process id so that concurrent instances
    /// spread out.
    fn bind_source_port(&mut self, socket: &Socket) -> Result<(), NetError> {
        let start = *self.last_source_port.get_or_insert_with(pid_port_base);
        let family = self.transport.family();

        let mut port = start;
        for _ in 0..MAX_SOURCE_PORT_CANDIDATES {
            port = next_candidate(port);
            if socket.bind(&family.source_endpoint(port).to_sock_addr()).is_ok() {
                trace!(port, "bound pid-derived source port");
                self.last_source_port = Some(port);
                return Ok(());
            }
        }
        Err(NetError::SourcePortExhausted {
            start,
            attempts: MAX_SOURCE_PORT_CANDIDATES,
        })
    }
}

/// Connect failures worth retrying on a fresh socket.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::WouldBlock
    )
}

/// Resolve `host` to its first IPv4 address.
pub fn resolve_host(host: &str) -> Result<Ipv4Addr, NetError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (host, 0u16).to_socket_addrs().map_err(|e| NetError::Resolve {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    addrs
        .into_iter()
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| NetError::Resolve {
            host: host.to_string(),
            reason: "no IPv4 address".into(),
        })
}

fn pid_port_base() -> u16 {
    let port = (std::process::id() << 4) as u16;
    if port < FIRST_UNPRIVILEGED_PORT {
        port + FIRST_UNPRIVILEGED_PORT
    } else {
        port
    }
}

fn next_candidate(port: u16) -> u16 {
    match port.wrapping_add(1) {
        p if p < FIRST_UNPRIVILEGED_PORT => FIRST_UNPRIVILEGED_PORT,
        p => p,
    }
}
