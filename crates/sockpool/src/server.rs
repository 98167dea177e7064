//! Accept-and-dispatch server on top of [`ConnectionRegistry`].
//!
//! Two ways to drive a [`Server`]:
//!
//! - [`Server::accept_loop`] hands every accepted connection to a replier
//!   closure on the calling thread, one at a time, until the closure says
//!   stop or the [`StopToken`] fires.
//! - [`Server::run`] spawns an accept thread that registers connections
//!   for read readiness, while the calling thread waits on the registry
//!   and passes ready connections to a [`ConnectionHandler`].
//!
//! Both loops check their token at least once per configured interval, so
//! stopping never waits longer than `accept_poll_interval_ms` or
//! `poll_timeout_ms`. A token built by [`Server::stop_token`] also wakes
//! the registry, which makes `run` notice immediately.

use crate::address::Address;
use crate::config::{PoolConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::registry::{ConnectionRegistry, Interest, Readiness, Waker};
use crate::socket::{ActiveConnection, PassiveSocket};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, trace, warn};

// =============================================================================
// StopToken
// =============================================================================

/// Shared stop flag for server and client loops.
///
/// Clones observe the same flag. Stopping is permanent.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
    waker: Option<Waker>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also wake `waker` when stopped, so a thread blocked in
    /// `ConnectionRegistry::get` returns right away.
    #[must_use]
    pub fn with_waker(mut self, waker: Waker) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.wake() {
                debug!(error = %err, "stop could not wake poller");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// What to do with a connection after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave it registered with the same interest
    Keep,
    /// Leave it registered with a new interest
    Watch(Interest),
    /// Deregister it; it shuts down once the last reference is gone
    Close,
}

/// Reacts to readiness on a registered connection.
pub trait ConnectionHandler {
    fn on_ready(&mut self, connection: &ActiveConnection, events: Readiness) -> Disposition;
}

impl<F> ConnectionHandler for F
where
    F: FnMut(&ActiveConnection, Readiness) -> Disposition,
{
    fn on_ready(&mut self, connection: &ActiveConnection, events: Readiness) -> Disposition {
        self(connection, events)
    }
}

/// Writes back whatever it reads; closes on end of stream or error.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    buf: Vec<u8>,
}

impl EchoHandler {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buf: vec![0; buffer_size.max(1)],
        }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl ConnectionHandler for EchoHandler {
    fn on_ready(&mut self, connection: &ActiveConnection, events: Readiness) -> Disposition {
        if events.is_error() {
            return Disposition::Close;
        }
        if !events.is_readable() {
            return if events.is_hangup() {
                Disposition::Close
            } else {
                Disposition::Keep
            };
        }
        match connection.read(&mut self.buf) {
            Ok(0) => Disposition::Close,
            Ok(n) => match connection.write_all(&self.buf[..n]) {
                Ok(()) => Disposition::Keep,
                Err(err) => {
                    debug!(id = %connection.id(), error = %err, "echo write failed");
                    Disposition::Close
                }
            },
            Err(err) => {
                debug!(id = %connection.id(), error = %err, "echo read failed");
                Disposition::Close
            }
        }
    }
}

/// Counters reported by [`Server::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    /// Connections accepted from the listener
    pub accepted: u64,
    /// Accepted connections closed because the registry was full
    pub rejected: u64,
    /// Handler invocations
    pub dispatched: u64,
    /// Connections deregistered on `Disposition::Close`
    pub closed: u64,
}

// =============================================================================
// Server
// =============================================================================

/// A listening socket plus the registry its connections go into.
#[derive(Debug)]
pub struct Server {
    listener: PassiveSocket,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    pool: PoolConfig,
}

impl Server {
    pub fn bind(config: &ServerConfig, pool: &PoolConfig) -> Result<Self> {
        let listener = PassiveSocket::bind(&config.listen, config.backlog)?;
        let registry = Arc::new(ConnectionRegistry::new(pool.capacity)?);
        info!(address = %config.listen, capacity = pool.capacity, "server bound");
        Ok(Self {
            listener,
            registry,
            config: config.clone(),
            pool: pool.clone(),
        })
    }

    /// The address clients should connect to (resolves port 0).
    pub fn local_address(&self) -> Result<Address> {
        self.listener.local_address()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// A fresh token wired to this server's registry.
    pub fn stop_token(&self) -> StopToken {
        StopToken::new().with_waker(self.registry.waker())
    }

    /// Accept connections and pass each to `replier` until it returns
    /// `false` or `stop` fires. Returns the number of connections handed
    /// out. Nothing is registered.
    pub fn accept_loop<F>(&self, mut replier: F, stop: &StopToken) -> Result<u64>
    where
        F: FnMut(ActiveConnection) -> bool,
    {
        let mut served = 0;
        while !stop.is_stopped() {
            let Some(connection) = self.try_accept()? else {
                continue;
            };
            served += 1;
            if !replier(connection) {
                debug!(served, "replier ended accept loop");
                break;
            }
        }
        Ok(served)
    }

    /// Serve until `stop` fires or an OS error occurs.
    ///
    /// Accepted connections are registered for read readiness from a
    /// second thread. When the registry is full the new connection is
    /// closed and counted in [`ServeStats::rejected`]. A failure on either
    /// thread ends both and is returned.
    pub fn run<H>(&self, mut handler: H, stop: &StopToken) -> Result<ServeStats>
    where
        H: ConnectionHandler,
    {
        let halt = self.stop_token();
        let mut stats = ServeStats::default();

        let (polled, accepted) = thread::scope(|scope| {
            let acceptor = thread::Builder::new()
                .name("sockpool-accept".to_string())
                .spawn_scoped(scope, || {
                    let result = self.accept_into_registry(stop, &halt);
                    halt.stop();
                    result
                })
                .map_err(|err| Error::os("spawn", err));
            let acceptor = match acceptor {
                Ok(acceptor) => acceptor,
                Err(err) => return (Err(err), Ok((0, 0))),
            };

            let polled = self.dispatch_ready(&mut handler, stop, &halt, &mut stats);
            halt.stop();
            let accepted = acceptor
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (polled, accepted)
        });

        polled?;
        let (accepted, rejected) = accepted?;
        stats.accepted = accepted;
        stats.rejected = rejected;
        info!(?stats, "server stopped");
        Ok(stats)
    }

    fn accept_into_registry(&self, stop: &StopToken, halt: &StopToken) -> Result<(u64, u64)> {
        let (mut accepted, mut rejected) = (0, 0);
        while !stop.is_stopped() && !halt.is_stopped() {
            let Some(connection) = self.try_accept()? else {
                continue;
            };
            accepted += 1;
            match self.registry.add(connection, Interest::READABLE) {
                Ok(id) => trace!(%id, "connection registered"),
                Err(err) if err.is_recoverable() => {
                    rejected += 1;
                    warn!(error = %err, "closing connection the registry cannot take");
                }
                Err(err) => return Err(err),
            }
        }
        Ok((accepted, rejected))
    }

    fn dispatch_ready<H>(
        &self,
        handler: &mut H,
        stop: &StopToken,
        halt: &StopToken,
        stats: &mut ServeStats,
    ) -> Result<()>
    where
        H: ConnectionHandler,
    {
        let timeout = Some(self.pool.poll_timeout());
        while !stop.is_stopped() && !halt.is_stopped() {
            for ready in self.registry.get(timeout)? {
                stats.dispatched += 1;
                let id = ready.id();
                match handler.on_ready(&ready.connection, ready.events) {
                    Disposition::Keep => {}
                    Disposition::Watch(interest) => {
                        if let Err(err) = self.registry.set(id, interest) {
                            trace!(%id, error = %err, "interest change after removal");
                        }
                    }
                    Disposition::Close => {
                        if self.registry.remove(id).is_ok() {
                            stats.closed += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait one accept interval for a pending connection and accept it.
    /// Transient accept failures count as "nothing pending".
    fn try_accept(&self) -> Result<Option<ActiveConnection>> {
        if !self
            .listener
            .wait_acceptable(Some(self.config.accept_poll_interval()))?
        {
            return Ok(None);
        }
        match self.listener.accept() {
            Ok(connection) => Ok(Some(connection)),
            Err(Error::Os { op, source }) if is_transient_accept(&source) => {
                debug!(op, error = %source, "transient accept failure");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_transient_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn unix_server(dir: &tempfile::TempDir, capacity: usize) -> Server {
        let config = ServerConfig {
            listen: Address::unix(dir.path().join("srv.sock")),
            backlog: 16,
            accept_poll_interval_ms: 10,
        };
        let pool = PoolConfig {
            capacity,
            poll_timeout_ms: 50,
        };
        Server::bind(&config, &pool).unwrap()
    }

    #[test]
    fn stop_token_clones_share_flag() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());
        token.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn stop_token_wakes_registry() {
        let registry = ConnectionRegistry::new(1).unwrap();
        let token = StopToken::new().with_waker(registry.waker());
        token.stop();
        let start = Instant::now();
        assert!(registry.get(Some(Duration::from_secs(5))).unwrap().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn echo_handler_echoes_then_closes_on_eof() {
        let (a, b) = ActiveConnection::pair().unwrap();
        let mut echo = EchoHandler::new(16);
        b.write_all(b"hello").unwrap();
        assert_eq!(echo.on_ready(&a, Readiness::READABLE), Disposition::Keep);
        let mut buf = [0u8; 5];
        (&b).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        b.shutdown().unwrap();
        assert_eq!(echo.on_ready(&a, Readiness::READABLE), Disposition::Close);
        assert_eq!(echo.on_ready(&a, Readiness::ERROR), Disposition::Close);
    }

    #[test]
    fn closure_is_a_handler() {
        let (a, _b) = ActiveConnection::pair().unwrap();
        let mut calls = 0;
        let mut handler = |_: &ActiveConnection, _: Readiness| {
            calls += 1;
            Disposition::Watch(Interest::WRITABLE)
        };
        assert_eq!(
            handler.on_ready(&a, Readiness::READABLE),
            Disposition::Watch(Interest::WRITABLE)
        );
        assert_eq!(calls, 1);
    }

    #[test]
    fn accept_loop_stops_when_replier_declines() {
        let dir = tempfile::tempdir().unwrap();
        let server = unix_server(&dir, 4);
        let address = server.local_address().unwrap();

        let client = thread::spawn(move || {
            for _ in 0..2 {
                let conn = dial::connect(&address).unwrap();
                let mut reply = Vec::new();
                (&conn).read_to_end(&mut reply).unwrap();
                assert_eq!(reply, b"hi");
            }
        });

        let stop = StopToken::new();
        let mut seen = 0;
        let served = server
            .accept_loop(
                |conn| {
                    conn.write_all(b"hi").unwrap();
                    seen += 1;
                    seen < 2
                },
                &stop,
            )
            .unwrap();
        client.join().unwrap();
        assert_eq!(served, 2);
    }

    #[test]
    fn accept_loop_observes_stop_token() {
        let dir = tempfile::tempdir().unwrap();
        let server = unix_server(&dir, 4);
        let stop = StopToken::new();
        let remote = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.stop();
        });
        let served = server.accept_loop(|_| true, &stop).unwrap();
        stopper.join().unwrap();
        assert_eq!(served, 0);
    }

    #[test]
    fn run_echoes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let server = unix_server(&dir, 8);
        let address = server.local_address().unwrap();
        let stop = server.stop_token();
        let remote = stop.clone();

        let client = thread::spawn(move || {
            let conn = dial::connect(&address).unwrap();
            conn.write_all(b"round trip").unwrap();
            let mut buf = [0u8; 10];
            (&conn).read_exact(&mut buf).unwrap();
            drop(conn);
            remote.stop();
            buf
        });

        let stats = server.run(EchoHandler::default(), &stop).unwrap();
        assert_eq!(&client.join().unwrap(), b"round trip");
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 0);
        assert!(stats.dispatched >= 1);
    }

    #[test]
    fn run_rejects_over_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let server = unix_server(&dir, 1);
        let address = server.local_address().unwrap();
        let stop = server.stop_token();
        let remote = stop.clone();

        let client = thread::spawn(move || {
            let first = dial::connect(&address).unwrap();
            first.write_all(b"x").unwrap();
            let mut one = [0u8; 1];
            (&first).read_exact(&mut one).unwrap();

            // The registry is full now; the second connection gets closed.
            let second = dial::connect(&address).unwrap();
            let mut rest = Vec::new();
            let _ = (&second).read_to_end(&mut rest);
            assert!(rest.is_empty());
            remote.stop();
            drop(first);
        });

        let stats = server.run(EchoHandler::default(), &stop).unwrap();
        client.join().unwrap();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
    }
}
