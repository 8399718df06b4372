//! ONC RPC portmapper client (program 100000, version 2) over UDP.
//!
//! Calls carry AUTH_NULL credentials and are XDR encoded: every field is a
//! big-endian u32, opaque data is padded to a multiple of four bytes.
//! A call is retransmitted until a reply with the matching transaction id
//! arrives or the attempt budget is spent.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use super::{PortRegistry, RegistryError};

const PMAP_PROG: u32 = 100_000;
const PMAP_VERS: u32 = 2;
const RPC_VERSION: u32 = 2;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NULL: u32 = 0;

const IPPROTO_TCP: u32 = 6;

/// Portmapper's well-known port.
pub const PMAP_PORT: u16 = 111;

/// Version under which benchmark programs are registered.
pub const SERVICE_VERSION: u32 = 1;

const MAX_REPLY: usize = 512;

/// Portmapper procedures used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    Set = 1,
    Unset = 2,
    GetPort = 3,
}

/// The `pmap` argument structure shared by SET, UNSET and GETPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
    pub port: u32,
}

impl Mapping {
    fn tcp(program: u32, port: u32) -> Self {
        Mapping {
            program,
            version: SERVICE_VERSION,
            protocol: IPPROTO_TCP,
            port,
        }
    }
}

/// Encode a portmapper call message.
pub fn encode_call(xid: u32, procedure: Procedure, mapping: &Mapping) -> Bytes {
    let mut buf = BytesMut::with_capacity(56);
    buf.put_u32(xid);
    buf.put_u32(MSG_CALL);
    buf.put_u32(RPC_VERSION);
    buf.put_u32(PMAP_PROG);
    buf.put_u32(PMAP_VERS);
    buf.put_u32(procedure as u32);
    // credential, then verifier: flavor + zero-length body each
    buf.put_u32(AUTH_NULL);
    buf.put_u32(0);
    buf.put_u32(AUTH_NULL);
    buf.put_u32(0);
    buf.put_u32(mapping.program);
    buf.put_u32(mapping.version);
    buf.put_u32(mapping.protocol);
    buf.put_u32(mapping.port);
    buf.freeze()
}

/// Decode a reply to the call with `expected_xid`.
///
/// Returns `Ok(None)` for a reply to some other call, otherwise the single
/// u32 result (a boolean for SET/UNSET, a port for GETPORT).
pub fn decode_reply(expected_xid: u32, mut reply: &[u8]) -> Result<Option<u32>, RegistryError> {
    if take_u32(&mut reply)? != expected_xid {
        return Ok(None);
    }
    if take_u32(&mut reply)? != MSG_REPLY {
        return Err(RegistryError::Malformed("message is not a reply"));
    }
    if take_u32(&mut reply)? != MSG_ACCEPTED {
        return Err(RegistryError::Rejected("call denied".into()));
    }

    let _verifier_flavor = take_u32(&mut reply)?;
    let verifier_len = take_u32(&mut reply)? as usize;
    let padded = verifier_len
        .checked_add(3)
        .ok_or(RegistryError::Malformed("verifier length overflow"))?
        & !3;
    if reply.remaining() < padded {
        return Err(RegistryError::Malformed("truncated verifier"));
    }
    reply.advance(padded);

    let status = take_u32(&mut reply)?;
    if status != ACCEPT_SUCCESS {
        return Err(RegistryError::Rejected(format!("accept status {}", status)));
    }
    take_u32(&mut reply).map(Some)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, RegistryError> {
    if buf.remaining() < 4 {
        return Err(RegistryError::Malformed("truncated reply"));
    }
    Ok(buf.get_u32())
}

// ---------------------------------------------------------------------------
// Portmapper
// ---------------------------------------------------------------------------

/// Client for the system portmapper / rpcbind.
#[derive(Debug, Clone)]
pub struct Portmapper {
    /// Portmapper that receives SET / UNSET.
    local: SocketAddrV4,
    /// Port queried on remote hosts for GETPORT.
    remote_port: u16,
    timeout: Duration,
    attempts: u32,
}

impl Default for Portmapper {
    fn default() -> Self {
        Self::new(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, PMAP_PORT),
            PMAP_PORT,
            Duration::from_secs(1),
            3,
        )
    }
}

impl Portmapper {
    pub fn new(local: SocketAddrV4, remote_port: u16, timeout: Duration, attempts: u32) -> Self {
        Self {
            local,
            remote_port,
            timeout,
            attempts: attempts.max(1),
        }
    }

    fn call(&self, server: SocketAddrV4, procedure: Procedure, mapping: Mapping) -> Result<u32, RegistryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let xid: u32 = rand::random();
        let request = encode_call(xid, procedure, &mapping);
        let mut buf = [0u8; MAX_REPLY];

        for attempt in 1..=self.attempts {
            socket.send_to(&request, server)?;
            trace!(%server, ?procedure, xid, attempt, "portmapper call sent");

            let deadline = Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                socket.set_read_timeout(Some(remaining))?;
                match socket.recv_from(&mut buf) {
                    Ok((len, _from)) => match decode_reply(xid, &buf[..len])? {
                        Some(value) => return Ok(value),
                        None => trace!(xid, "ignoring reply to another call"),
                    },
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            debug!(%server, ?procedure, attempt, "portmapper call timed out");
        }

        Err(RegistryError::Timeout {
            addr: server.to_string(),
            attempts: self.attempts,
        })
    }
}

impl PortRegistry for Portmapper {
    fn register(&self, program: u32, port: u32) -> Result<(), RegistryError> {
        match self.call(self.local, Procedure::Set, Mapping::tcp(program, port))? {
            0 => Err(RegistryError::Refused),
            _ => Ok(()),
        }
    }

    fn unregister(&self, program: u32) -> Result<(), RegistryError> {
        // UNSET ignores protocol and port; a false result only means nothing was registered
        let mapping = Mapping {
            program,
            version: SERVICE_VERSION,
            protocol: 0,
            port: 0,
        };
        self.call(self.local, Procedure::Unset, mapping).map(|_| ())
    }

    fn lookup(&self, host: Ipv4Addr, program: u32) -> Result<Option<u32>, RegistryError> {
        let server = SocketAddrV4::new(host, self.remote_port);
        match self.call(server, Procedure::GetPort, Mapping::tcp(program, 0))? {
            0 => Ok(None),
            port => Ok(Some(port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn encode_reply(xid: u32, verifier: &[u8], status: u32, value: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(xid);
        buf.put_u32(MSG_REPLY);
        buf.put_u32(MSG_ACCEPTED);
        buf.put_u32(AUTH_NULL);
        buf.put_u32(verifier.len() as u32);
        buf.put_slice(verifier);
        for _ in 0..(4 - verifier.len() % 4) % 4 {
            buf.put_u8(0);
        }
        buf.put_u32(status);
        buf.put_u32(value);
        buf.to_vec()
    }

    /// Answer `requests` calls; `answer` maps (procedure, mapping) to the result word.
    fn fake_portmapper(
        requests: usize,
        answer: impl Fn(u32, Mapping) -> u32 + Send + 'static,
    ) -> (SocketAddrV4, thread::JoinHandle<Vec<u32>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = match socket.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            other => panic!("unexpected address {}", other),
        };
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 512];
            for _ in 0..requests {
                let (len, from) = socket.recv_from(&mut buf).unwrap();
                let mut call = &buf[..len];
                let xid = call.get_u32();
                call.advance(16);
                let procedure = call.get_u32();
                call.advance(16);
                let mapping = Mapping {
                    program: call.get_u32(),
                    version: call.get_u32(),
                    protocol: call.get_u32(),
                    port: call.get_u32(),
                };
                seen.push(procedure);
                let reply = encode_reply(xid, &[], ACCEPT_SUCCESS, answer(procedure, mapping));
                socket.send_to(&reply, from).unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn test_encode_getport_call() {
        let call = encode_call(0xdead_beef, Procedure::GetPort, &Mapping::tcp(44, 0));
        assert_eq!(call.len(), 56);
        let words: Vec<u32> = call.chunks(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect();
        assert_eq!(
            words,
            vec![0xdead_beef, 0, 2, 100_000, 2, 3, 0, 0, 0, 0, 44, 1, 6, 0]
        );
    }

    #[test]
    fn test_decode_success_skips_padded_verifier() {
        let reply = encode_reply(7, &[1, 2, 3, 4, 5], ACCEPT_SUCCESS, 40_000);
        assert_eq!(decode_reply(7, &reply).unwrap(), Some(40_000));
    }

    #[test]
    fn test_decode_other_xid_is_ignored() {
        let reply = encode_reply(8, &[], ACCEPT_SUCCESS, 1);
        assert_eq!(decode_reply(7, &reply).unwrap(), None);
    }

    #[test]
    fn test_decode_rejections() {
        let reply = encode_reply(7, &[], 1, 0);
        assert!(matches!(decode_reply(7, &reply), Err(RegistryError::Rejected(_))));

        let mut denied = BytesMut::new();
        denied.put_u32(7);
        denied.put_u32(MSG_REPLY);
        denied.put_u32(1);
        assert!(matches!(decode_reply(7, &denied), Err(RegistryError::Rejected(_))));

        let truncated = &encode_reply(7, &[], ACCEPT_SUCCESS, 1)[..20];
        assert!(matches!(decode_reply(7, truncated), Err(RegistryError::Malformed(_))));
    }

    #[test]
    fn test_lookup_against_fake_portmapper() {
        let (addr, handle) = fake_portmapper(2, |_, mapping| if mapping.program == 44 { 40_404 } else { 0 });
        let pm = Portmapper::new(addr, addr.port(), Duration::from_secs(2), 1);

        assert_eq!(pm.lookup(Ipv4Addr::LOCALHOST, 44).unwrap(), Some(40_404));
        assert_eq!(pm.lookup(Ipv4Addr::LOCALHOST, 45).unwrap(), None);
        assert_eq!(handle.join().unwrap(), vec![3, 3]);
    }

    #[test]
    fn test_register_and_unregister_against_fake_portmapper() {
        let (addr, handle) = fake_portmapper(3, |procedure, mapping| match procedure {
            1 if mapping.port == 0 => 0,
            _ => 1,
        });
        let pm = Portmapper::new(addr, addr.port(), Duration::from_secs(2), 1);

        pm.register(44, 40_404).unwrap();
        assert!(matches!(pm.register(44, 0), Err(RegistryError::Refused)));
        pm.unregister(44).unwrap();
        assert_eq!(handle.join().unwrap(), vec![1, 1, 2]);
    }

    #[test]
    fn test_silent_portmapper_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = match silent.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            other => panic!("unexpected address {}", other),
        };
        let pm = Portmapper::new(addr, addr.port(), Duration::from_millis(50), 2);
        match pm.lookup(Ipv4Addr::LOCALHOST, 44) {
            Err(RegistryError::Timeout { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
