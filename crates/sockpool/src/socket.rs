//! Passive (listening) and active (connected) sockets.
//!
//! [`PassiveSocket`] owns a bound, listening handle and produces
//! [`ActiveConnection`]s through [`PassiveSocket::accept`]. An active
//! connection is plain composition: a byte stream, the peer address and an
//! [`Identity`] taken from the descriptor number at construction.
//!
//! Dropping an `ActiveConnection` shuts the connection down in both
//! directions before the descriptor closes, so the peer sees an orderly
//! end of stream. The shutdown happens at most once no matter how many
//! times the value is moved, or whether `shutdown`/`close` ran first.

use crate::address::{Address, AddressKind};
use crate::error::{Error, Result, os_err};
use socket2::{SockRef, Socket, Type};
use sockpool_fd::{
    AsRawFileDescriptor, FileDescriptor, OwnedHandle, POLLIN, RawFileDescriptor, poll, pollfd,
};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Stable key of a connection: the descriptor number it was created with.
///
/// The kernel does not hand the same number to another descriptor while
/// this one is open, so identities are unique among live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(RawFileDescriptor);

impl Identity {
    pub fn raw(self) -> RawFileDescriptor {
        self.0
    }
}

impl From<RawFileDescriptor> for Identity {
    fn from(fd: RawFileDescriptor) -> Self {
        Self(fd)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// PassiveSocket
// =============================================================================

/// A bound and listening socket.
///
/// For unix domain addresses the socket file is unlinked on drop.
#[derive(Debug)]
pub struct PassiveSocket {
    handle: OwnedHandle,
    address: Address,
}

impl PassiveSocket {
    /// `socket(2)` + `bind(2)` + `listen(2)`.
    ///
    /// IP listeners get `SO_REUSEADDR` so a restarted server can rebind
    /// while old connections sit in `TIME_WAIT`. Nothing is retried.
    pub fn bind(address: &Address, backlog: i32) -> Result<Self> {
        let socket = Socket::new(address.domain(), Type::STREAM, None).map_err(os_err("socket"))?;
        if address.kind() == AddressKind::Ip {
            socket
                .set_reuse_address(true)
                .map_err(os_err("setsockopt"))?;
        }
        let sockaddr = address.to_sockaddr()?;
        socket.bind(&sockaddr).map_err(os_err("bind"))?;

        // The path exists from here on; build Self so a failed listen still unlinks it.
        let listener = Self {
            handle: OwnedHandle::new(socket),
            address: address.clone(),
        };
        SockRef::from(&listener.handle)
            .listen(backlog)
            .map_err(os_err("listen"))?;
        debug!(address = %listener.address, backlog, "listening");
        Ok(listener)
    }

    /// The address this socket was bound with.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The address the kernel actually bound, e.g. the port chosen for `:0`.
    pub fn local_address(&self) -> Result<Address> {
        let local = SockRef::from(&self.handle)
            .local_addr()
            .map_err(os_err("getsockname"))?;
        Address::from_sockaddr(self.address.kind(), &local)
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    /// Block until a connection is pending, then accept it.
    pub fn accept(&self) -> Result<ActiveConnection> {
        let (socket, peer) = SockRef::from(&self.handle)
            .accept()
            .map_err(os_err("accept"))?;
        let peer = Address::from_sockaddr(self.address.kind(), &peer)?;
        let connection = ActiveConnection::new(FileDescriptor::new(socket), peer);
        trace!(id = %connection.id(), peer = %connection.peer(), "accepted");
        Ok(connection)
    }

    /// Wait up to `timeout` for a pending connection so that `accept` will
    /// not block. An interrupted wait reports `false`.
    pub fn wait_acceptable(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = [pollfd {
            fd: self.handle.get(),
            events: POLLIN,
            revents: 0,
        }];
        match poll(&mut pfd, timeout) {
            Ok(n) => Ok(n > 0 && pfd[0].revents & POLLIN != 0),
            Err(sockpool_fd::Error::Poll(err)) if err.kind() == io::ErrorKind::Interrupted => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for PassiveSocket {
    fn drop(&mut self) {
        if let Address::Unix(path) = &self.address {
            if let Err(err) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %err, "failed to unlink unix socket");
            }
        }
    }
}

// =============================================================================
// ActiveConnection
// =============================================================================

/// A connected socket: byte stream + peer address + identity.
#[derive(Debug)]
pub struct ActiveConnection {
    stream: FileDescriptor,
    peer: Address,
    id: Identity,
    shut: AtomicBool,
}

impl ActiveConnection {
    pub fn new(stream: FileDescriptor, peer: Address) -> Self {
        let id = Identity(stream.as_raw_file_descriptor());
        Self {
            stream,
            peer,
            id,
            shut: AtomicBool::new(false),
        }
    }

    /// Two connections joined by `socketpair(2)`. Both peers are unnamed
    /// unix addresses.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = sockpool_fd::socketpair()?;
        Ok((
            Self::new(a, Address::Unix(PathBuf::new())),
            Self::new(b, Address::Unix(PathBuf::new())),
        ))
    }

    pub fn id(&self) -> Identity {
        self.id
    }

    pub fn peer(&self) -> &Address {
        &self.peer
    }

    pub fn stream(&self) -> &FileDescriptor {
        &self.stream
    }

    /// Open and not yet shut down.
    pub fn is_open(&self) -> bool {
        self.stream.is_open() && !self.shut.load(Ordering::Acquire)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.stream).read(buf).map_err(os_err("read"))
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        (&self.stream).write(buf).map_err(os_err("write"))
    }

    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        (&self.stream).write_all(buf).map_err(os_err("write"))
    }

    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<()> {
        self.stream.set_non_blocking(non_blocking)?;
        Ok(())
    }

    /// Shut down both directions. Only the first call reaches the kernel;
    /// a peer that is already gone (`ENOTCONN`) is not an error.
    pub fn shutdown(&self) -> Result<()> {
        if !self.stream.is_open() || self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => {
                Err(Error::os("shutdown", err))
            }
            _ => Ok(()),
        }
    }

    /// Half-close: signal end of stream to the peer while still reading.
    pub fn shutdown_write(&self) -> Result<()> {
        if !self.stream.is_open() {
            return Err(sockpool_fd::Error::EmptyHandle.into());
        }
        SockRef::from(&self.stream)
            .shutdown(Shutdown::Write)
            .map_err(os_err("shutdown"))
    }

    /// Shut down and close now, reporting failures instead of swallowing
    /// them the way drop does.
    pub fn close(&mut self) -> Result<()> {
        self.shutdown()?;
        self.stream.close()?;
        Ok(())
    }

    /// Point this connection's descriptor number at `fresh`, keeping the
    /// identity. `fresh` is closed when it goes out of scope in the caller.
    pub(crate) fn adopt(&mut self, fresh: &Socket) -> Result<()> {
        self.stream.handle_mut().redirect_from(fresh)?;
        self.shut.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            trace!(id = %self.id, error = %err, "ignoring shutdown failure on drop");
        }
    }
}

impl Read for ActiveConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for ActiveConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for &ActiveConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for &ActiveConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
