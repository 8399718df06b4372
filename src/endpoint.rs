//! Transport endpoints for the two supported address families.
//!
//! Callers work with [`Family`], [`Transport`] and [`Endpoint`] only; the
//! IPv4 / vsock differences (socket domain, address construction, wildcard
//! ports) live here.

use std::fmt;
use std::fs::File;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr};

/// Wildcard vsock context id (`VMADDR_CID_ANY`).
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Wildcard vsock port (`VMADDR_PORT_ANY`), asks the kernel for an ephemeral port.
pub const VMADDR_PORT_ANY: u32 = u32::MAX;

const VSOCK_DEVICE: &str = "/dev/vsock";

/// `IOCTL_VM_SOCKETS_GET_LOCAL_CID` from `linux/vm_sockets.h`.
const IOCTL_VM_SOCKETS_GET_LOCAL_CID: libc::c_ulong = 0x7b9;

// ---------------------------------------------------------------------------
// Family
// ---------------------------------------------------------------------------

/// Socket address family used for a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Inet,
    Vsock,
}

impl Family {
    pub fn domain(self) -> Domain {
        match self {
            Family::Inet => Domain::IPV4,
            Family::Vsock => Domain::VSOCK,
        }
    }

    pub fn protocol(self) -> Option<Protocol> {
        match self {
            Family::Inet => Some(Protocol::TCP),
            // SOCK_STREAM is the only vsock stream protocol
            Family::Vsock => None,
        }
    }

    /// Address to bind a listener on. vsock listeners always bind to the
    /// local context id; `inet_addr` is ignored for them.
    pub fn listen_endpoint(self, inet_addr: Ipv4Addr, port: Option<u16>) -> io::Result<Endpoint> {
        match self {
            Family::Inet => Ok(Endpoint::Inet(SocketAddrV4::new(inet_addr, port.unwrap_or(0)))),
            Family::Vsock => Ok(Endpoint::Vsock {
                cid: local_cid()?,
                port: port.map(u32::from).unwrap_or(VMADDR_PORT_ANY),
            }),
        }
    }

    /// Wildcard local address with a specific source port, for clients that
    /// pin their source port.
    pub fn source_endpoint(self, port: u16) -> Endpoint {
        match self {
            Family::Inet => Endpoint::Inet(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            Family::Vsock => Endpoint::Vsock {
                cid: VMADDR_CID_ANY,
                port: u32::from(port),
            },
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet => write!(f, "inet"),
            Family::Vsock => write!(f, "vsock"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Client-side view of the family: vsock clients name the peer context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Inet,
    Vsock { cid: u32 },
}

impl Transport {
    pub fn family(self) -> Family {
        match self {
            Transport::Inet => Family::Inet,
            Transport::Vsock { .. } => Family::Vsock,
        }
    }

    /// Build the peer endpoint. `host` is only consulted for IPv4.
    pub fn peer_endpoint(self, host: Ipv4Addr, port: u32) -> Endpoint {
        match self {
            // callers validate that IPv4 ports fit in 16 bits
            Transport::Inet => Endpoint::Inet(SocketAddrV4::new(host, port as u16)),
            Transport::Vsock { cid } => Endpoint::Vsock { cid, port },
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A concrete address in one of the supported families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Inet(SocketAddrV4),
    Vsock { cid: u32, port: u32 },
}

impl Endpoint {
    pub fn family(&self) -> Family {
        match self {
            Endpoint::Inet(_) => Family::Inet,
            Endpoint::Vsock { .. } => Family::Vsock,
        }
    }

    pub fn port(&self) -> u32 {
        match self {
            Endpoint::Inet(addr) => u32::from(addr.port()),
            Endpoint::Vsock { port, .. } => *port,
        }
    }

    pub fn to_sock_addr(&self) -> SockAddr {
        match self {
            Endpoint::Inet(addr) => SockAddr::from(*addr),
            Endpoint::Vsock { cid, port } => SockAddr::vsock(*cid, *port),
        }
    }

    pub fn from_sock_addr(addr: &SockAddr) -> Option<Endpoint> {
        if let Some(v4) = addr.as_socket_ipv4() {
            return Some(Endpoint::Inet(v4));
        }
        addr.as_vsock_address()
            .map(|(cid, port)| Endpoint::Vsock { cid, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => write!(f, "{}", addr),
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
        }
    }
}

/// Context id of this machine, read from the vsock device.
pub fn local_cid() -> io::Result<u32> {
    let device = File::open(VSOCK_DEVICE)?;
    let mut cid: u32 = 0;
    // SAFETY: the ioctl writes a single u32 through a pointer to a live local.
    let rc = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            IOCTL_VM_SOCKETS_GET_LOCAL_CID as _,
            &mut cid as *mut u32,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(cid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet_sock_addr_round_trip() {
        let ep = Endpoint::Inet(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 3962));
        let back = Endpoint::from_sock_addr(&ep.to_sock_addr()).unwrap();
        assert_eq!(ep, back);
        assert_eq!(back.port(), 3962);
        assert_eq!(back.to_string(), "10.1.2.3:3962");
    }

    #[test]
    fn test_vsock_sock_addr_round_trip() {
        let ep = Endpoint::Vsock { cid: 3, port: 70_000 };
        let back = Endpoint::from_sock_addr(&ep.to_sock_addr()).unwrap();
        assert_eq!(ep, back);
        assert_eq!(back.family(), Family::Vsock);
        assert_eq!(back.to_string(), "vsock:3:70000");
    }

    #[test]
    fn test_transport_peer_endpoint() {
        let host = Ipv4Addr::LOCALHOST;
        assert_eq!(
            Transport::Inet.peer_endpoint(host, 80),
            Endpoint::Inet(SocketAddrV4::new(host, 80))
        );
        assert_eq!(
            Transport::Vsock { cid: 2 }.peer_endpoint(host, 80),
            Endpoint::Vsock { cid: 2, port: 80 }
        );
    }

    #[test]
    fn test_inet_listen_endpoint_defaults_to_ephemeral() {
        let ep = Family::Inet.listen_endpoint(Ipv4Addr::LOCALHOST, None).unwrap();
        assert_eq!(ep.port(), 0);
        let ep = Family::Inet.listen_endpoint(Ipv4Addr::LOCALHOST, Some(7070)).unwrap();
        assert_eq!(ep.port(), 7070);
    }
}
