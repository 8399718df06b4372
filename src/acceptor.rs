//! Connection acceptor and the I/O handle for accepted connections.
//!
//! Sockets of either family are put in non-blocking mode and driven through
//! tokio's [`AsyncFd`], so the servers share one code path for IPv4 and vsock.

use std::io::{self, Read, Write};

use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::socket::{tune_socket, SockOpts};

/// A listening socket registered with the runtime.
pub struct Listener {
    inner: AsyncFd<Socket>,
    opts: SockOpts,
}

impl Listener {
    /// Wrap a listening socket. `opts` are applied to every accepted
    /// connection. Must be called inside a tokio runtime.
    pub fn new(socket: Socket, opts: SockOpts) -> Result<Self, NetError> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
            opts,
        })
    }

    /// Accept the next connection. Interrupted calls are retried; any other
    /// accept failure is returned as [`NetError::Accept`].
    pub async fn accept(&self) -> Result<Connection, NetError> {
        loop {
            let mut guard = self.inner.readable().await.map_err(NetError::Accept)?;
            let (socket, peer) = match guard.try_io(|fd| fd.get_ref().accept()) {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(NetError::Accept(e)),
                Err(_would_block) => continue,
            };

            tune_socket(&socket, self.opts);
            let peer = Endpoint::from_sock_addr(&peer);
            trace!(?peer, "connection accepted");
            return Connection::new(socket, peer);
        }
    }
}

/// One accepted connection, exclusively owned by whoever handles it.
/// Dropping it closes the socket.
pub struct Connection {
    inner: AsyncFd<Socket>,
    peer: Option<Endpoint>,
}

impl Connection {
    pub fn new(socket: Socket, peer: Option<Endpoint>) -> Result<Self, NetError> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
            peer,
        })
    }

    pub fn peer(&self) -> Option<Endpoint> {
        self.peer
    }

    /// Read whatever is available, `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|fd| fd.get_ref().read(buf)) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Read until `buf` is full or the peer closes; returns the bytes read.
    pub async fn read_full(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|fd| fd.get_ref().write(buf)) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}
