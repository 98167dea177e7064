//! Outbound connections.
//!
//! No retries or backoff happen here; a failed dial is returned to the
//! caller, who owns the retry policy.

use crate::address::Address;
use crate::error::{Result, os_err};
use crate::socket::ActiveConnection;
use socket2::{Socket, Type};
use sockpool_fd::FileDescriptor;
use std::time::Duration;
use tracing::debug;

fn dial(address: &Address, timeout: Option<Duration>) -> Result<Socket> {
    let socket = Socket::new(address.domain(), Type::STREAM, None).map_err(os_err("socket"))?;
    let sockaddr = address.to_sockaddr()?;
    match timeout {
        Some(timeout) => socket.connect_timeout(&sockaddr, timeout),
        None => socket.connect(&sockaddr),
    }
    .map_err(os_err("connect"))?;
    Ok(socket)
}

/// Connect to `address`, blocking until the connection is established.
pub fn connect(address: &Address) -> Result<ActiveConnection> {
    let socket = dial(address, None)?;
    let connection = ActiveConnection::new(FileDescriptor::new(socket), address.clone());
    debug!(id = %connection.id(), peer = %address, "connected");
    Ok(connection)
}

/// Like [`connect`], giving up after `timeout`.
pub fn connect_timeout(address: &Address, timeout: Duration) -> Result<ActiveConnection> {
    let socket = dial(address, Some(timeout))?;
    Ok(ActiveConnection::new(FileDescriptor::new(socket), address.clone()))
}

/// Resolve `host` and connect to the first address it yields.
pub fn connect_host(host: &str, port: u16) -> Result<ActiveConnection> {
    connect(&Address::from_host(host, port)?)
}

/// Re-establish `connection` in place.
///
/// The existing connection is shut down in both directions, a new one is
/// dialed to the same peer, and the new socket is moved onto the old
/// descriptor number. The connection's identity does not change, so a
/// caller that keys state on it can keep that state.
pub fn reconnect(connection: &mut ActiveConnection) -> Result<()> {
    connection.shutdown()?;
    let fresh = dial(connection.peer(), None)?;
    connection.adopt(&fresh)?;
    debug!(id = %connection.id(), peer = %connection.peer(), "reconnected");
    Ok(())
}
