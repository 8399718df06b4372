//! Socket factory: stream socket creation and performance tuning.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};

use socket2::{Socket, Type};
use tracing::{trace, warn};

use crate::endpoint::Family;
use crate::error::NetError;

/// Initial send/receive buffer request; halved until the kernel accepts it.
pub const SOCKBUF: usize = 1024 * 1024;

/// Buffer sizing gives up below this.
const MIN_SOCKBUF: usize = 1024;

/// Bit-set of tuning options applied by [`tune_socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockOpts(u8);

impl SockOpts {
    pub const NONE: SockOpts = SockOpts(0);
    /// Enlarge the receive buffer.
    pub const READ: SockOpts = SockOpts(0x01);
    /// Enlarge the send buffer.
    pub const WRITE: SockOpts = SockOpts(0x02);
    pub const RDWR: SockOpts = SockOpts(0x03);
    /// Bind client sockets to a source port derived from the process id.
    pub const PID: SockOpts = SockOpts(0x04);
    /// `SO_REUSEADDR`, best effort.
    pub const REUSE: SockOpts = SockOpts(0x08);

    pub fn contains(self, other: SockOpts) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for SockOpts {
    type Output = SockOpts;

    fn bitor(self, rhs: SockOpts) -> SockOpts {
        SockOpts(self.0 | rhs.0)
    }
}

impl BitOrAssign for SockOpts {
    fn bitor_assign(&mut self, rhs: SockOpts) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for SockOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (SockOpts::READ, "read"),
            (SockOpts::WRITE, "write"),
            (SockOpts::PID, "pid"),
            (SockOpts::REUSE, "reuse"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Create a blocking stream socket in `family`.
pub fn create_socket(family: Family) -> Result<Socket, NetError> {
    let socket =
        Socket::new(family.domain(), Type::STREAM, family.protocol()).map_err(NetError::Socket)?;
    trace!(%family, "socket created");
    Ok(socket)
}

/// Apply the buffer and reuse options in `opts`. Never fails: an option the
/// kernel refuses is logged and skipped. [`SockOpts::PID`] is handled by the
/// locator, not here.
pub fn tune_socket(socket: &Socket, opts: SockOpts) {
    if opts.contains(SockOpts::READ) {
        match shrink_until_accepted(SOCKBUF, |size| socket.set_recv_buffer_size(size)) {
            Some(size) => trace!(kib = size >> 10, "receive buffer sized"),
            None => warn!("receive buffer sizing rejected down to {} bytes", MIN_SOCKBUF),
        }
    }
    if opts.contains(SockOpts::WRITE) {
        match shrink_until_accepted(SOCKBUF, |size| socket.set_send_buffer_size(size)) {
            Some(size) => trace!(kib = size >> 10, "send buffer sized"),
            None => warn!("send buffer sizing rejected down to {} bytes", MIN_SOCKBUF),
        }
    }
    if opts.contains(SockOpts::REUSE) {
        if let Err(e) = socket.set_reuse_address(true) {
            warn!(error = %e, "SO_REUSEADDR not applied");
        }
    }
}

/// Try `target`, halving on each rejection. Returns the accepted size.
fn shrink_until_accepted(target: usize, mut apply: impl FnMut(usize) -> io::Result<()>) -> Option<usize> {
    let mut size = target;
    while size >= MIN_SOCKBUF {
        if apply(size).is_ok() {
            return Some(size);
        }
        size >>= 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockopts_bitset() {
        let opts = SockOpts::READ | SockOpts::REUSE;
        assert!(opts.contains(SockOpts::READ));
        assert!(opts.contains(SockOpts::REUSE));
        assert!(!opts.contains(SockOpts::WRITE));
        assert!(!opts.contains(SockOpts::RDWR));
        assert!(opts.contains(SockOpts::NONE));
        assert_eq!(opts.to_string(), "read|reuse");
        assert_eq!(SockOpts::NONE.to_string(), "none");

        let mut all = SockOpts::NONE;
        all |= SockOpts::RDWR;
        assert!(all.contains(SockOpts::READ) && all.contains(SockOpts::WRITE));
    }

    #[test]
    fn test_buffer_halves_until_accepted() {
        let mut tried = Vec::new();
        let accepted = shrink_until_accepted(SOCKBUF, |size| {
            tried.push(size);
            if size > 128 * 1024 {
                Err(io::Error::from(io::ErrorKind::InvalidInput))
            } else {
                Ok(())
            }
        });
        assert_eq!(accepted, Some(128 * 1024));
        assert_eq!(tried, vec![1024 * 1024, 512 * 1024, 256 * 1024, 128 * 1024]);
    }

    #[test]
    fn test_buffer_sizing_gives_up_at_floor() {
        let accepted = shrink_until_accepted(SOCKBUF, |_| Err(io::Error::from(io::ErrorKind::InvalidInput)));
        assert_eq!(accepted, None);
    }

    #[test]
    fn test_tune_applies_reuse() {
        let socket = create_socket(Family::Inet).unwrap();
        tune_socket(&socket, SockOpts::REUSE | SockOpts::RDWR);
        assert!(socket.reuse_address().unwrap());
        assert!(socket.recv_buffer_size().unwrap() >= MIN_SOCKBUF);
    }
}
