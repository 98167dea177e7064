//! Sender-driven client loop.

use crate::address::Address;
use crate::dial;
use crate::error::Result;
use crate::server::StopToken;
use crate::socket::ActiveConnection;
use tracing::debug;

/// One outbound connection plus the closure that drives it.
///
/// The sender is called with the connection until it returns `false`.
/// It owns all protocol and error handling; it may also call
/// [`dial::reconnect`] on the connection it is given.
pub struct Client<F> {
    connection: ActiveConnection,
    sender: F,
}

impl<F> Client<F>
where
    F: FnMut(&mut ActiveConnection) -> bool,
{
    pub fn connect(address: &Address, sender: F) -> Result<Self> {
        Ok(Self::from_connection(dial::connect(address)?, sender))
    }

    pub fn from_connection(connection: ActiveConnection, sender: F) -> Self {
        Self { connection, sender }
    }

    pub fn connection(&self) -> &ActiveConnection {
        &self.connection
    }

    pub fn into_connection(self) -> ActiveConnection {
        self.connection
    }

    /// Call the sender until it returns `false`. Returns how many calls
    /// were made.
    pub fn run(&mut self) -> u64 {
        self.run_until(&StopToken::new())
    }

    /// Like [`Client::run`], also checking `stop` before every call.
    pub fn run_until(&mut self, stop: &StopToken) -> u64 {
        let mut rounds = 0;
        while !stop.is_stopped() {
            rounds += 1;
            if !(self.sender)(&mut self.connection) {
                break;
            }
        }
        debug!(id = %self.connection.id(), rounds, "client finished");
        rounds
    }
}

impl<F> std::fmt::Debug for Client<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
