//! Connection registry with readiness polling.
//!
//! A [`ConnectionRegistry`] owns a set of [`ActiveConnection`]s keyed by
//! [`Identity`], each tagged with an [`Interest`]. One thread blocks in
//! [`ConnectionRegistry::get`] waiting for readiness while other threads
//! `add`, `set` and `remove` connections.
//!
//! # Design
//!
//! ```text
//! get():   lock → snapshot [wake_rx, conn_1 .. conn_n] → unlock
//!          poll(2)                         (lock NOT held)
//!          drain wake_rx if readable
//!          lock → translate revents back to connections → unlock
//!
//! add():   lock → insert → unlock → write 1 byte to wake_tx
//! ```
//!
//! A `get` that is blocked on a snapshot taken before an `add` cannot see
//! the new descriptor. The byte written by `add` makes the wake pipe
//! readable, so that `get` returns promptly (possibly with nothing ready),
//! and the next `get` snapshots the new connection. A registration is
//! therefore visible no later than one extra `get` call.
//!
//! The wake pipe read end is always entry 0 of the poll set. Wake-up writes
//! are non-blocking: a full pipe already guarantees a pending wake-up, so
//! `EAGAIN` is not an error. Pending bytes are drained all at once; several
//! wake-ups may collapse into one return from `get`, which is harmless
//! because every `get` rebuilds its poll set from scratch.
//!
//! Two threads calling `get` on the same registry can both be handed the
//! same ready connection. Clearing interest with `set` (or removing the
//! connection) before doing I/O is the caller's job.

use crate::error::{Error, Result};
use crate::socket::{ActiveConnection, Identity};
use bitflags::bitflags;
use parking_lot::Mutex;
use sockpool_fd::{
    AsRawFileDescriptor, FileDescriptor, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, Pipe,
    SharedHandle, poll, pollfd,
};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

bitflags! {
    /// Conditions a caller wants reported for a registered connection.
    ///
    /// `poll(2)` reports hang-up and error conditions whether or not they
    /// were asked for; `HANGUP | ERROR` on its own is the quiescent interest
    /// that stops readable/writable dispatch without deregistering.
    #[derive(Default)]
    pub struct Interest: i16 {
        const READABLE = POLLIN;
        const WRITABLE = POLLOUT;
        const HANGUP = POLLHUP;
        const ERROR = POLLERR;
    }
}

bitflags! {
    /// Conditions observed on a connection by the last `get`.
    #[derive(Default)]
    pub struct Readiness: i16 {
        const READABLE = POLLIN;
        const WRITABLE = POLLOUT;
        const HANGUP = POLLHUP;
        const ERROR = POLLERR;
        const INVALID = POLLNVAL;
    }
}

impl Readiness {
    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    /// `POLLERR`, or `POLLNVAL` for a descriptor that is no longer open.
    pub fn is_error(self) -> bool {
        self.intersects(Self::ERROR | Self::INVALID)
    }
}

/// A registered connection. The registry holds one reference; `get` and
/// `remove` hand out more.
pub type ConnectionRef = Arc<ActiveConnection>;

/// One entry of a `get` batch.
#[derive(Debug, Clone)]
pub struct ReadyConnection {
    pub connection: ConnectionRef,
    pub events: Readiness,
}

impl ReadyConnection {
    pub fn id(&self) -> Identity {
        self.connection.id()
    }
}

/// Wakes a thread blocked in [`ConnectionRegistry::get`] from anywhere.
///
/// Holds its own reference to the wake pipe's write end. Once the registry
/// is dropped the read end is closed, so `wake` fails with `EPIPE`, and the
/// process receives `SIGPIPE` unless that signal is ignored.
#[derive(Debug, Clone)]
pub struct Waker {
    tx: SharedHandle,
}

impl Waker {
    /// Write one byte to the wake pipe.
    pub fn wake(&self) -> Result<()> {
        loop {
            match self.tx.write_bytes(&[1]) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::os("write", err)),
            }
        }
    }
}

struct Entry {
    connection: ConnectionRef,
    interest: Interest,
}

struct State {
    entries: HashMap<Identity, Entry>,
    capacity: usize,
    /// Reused poll buffer; taken out while a `get` is polling.
    scratch: Vec<pollfd>,
}

/// Thread-safe set of connections plus a self-pipe woken poller.
pub struct ConnectionRegistry {
    state: Mutex<State>,
    wake_rx: FileDescriptor,
    waker: Waker,
}

impl ConnectionRegistry {
    /// Create a registry that accepts up to `capacity` connections.
    pub fn new(capacity: usize) -> Result<Self> {
        let pipe = Pipe::new()?;
        pipe.read.set_non_blocking(true)?;
        pipe.write.set_non_blocking(true)?;
        Ok(Self {
            state: Mutex::new(State {
                entries: HashMap::with_capacity(capacity),
                capacity,
                scratch: Vec::with_capacity(capacity + 1),
            }),
            wake_rx: pipe.read,
            waker: Waker {
                tx: SharedHandle::new(pipe.write.into_handle()),
            },
        })
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Make room for `additional` more connections.
    pub fn reserve(&self, additional: usize) {
        let mut state = self.state.lock();
        state.capacity += additional;
        let capacity = state.capacity;
        state.entries.reserve(additional);
        state.scratch.reserve(capacity + 1);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Identity) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Identities of every registered connection, in no particular order.
    pub fn ids(&self) -> Vec<Identity> {
        self.state.lock().entries.keys().copied().collect()
    }

    pub fn interest(&self, id: Identity) -> Result<Interest> {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.interest)
            .ok_or(Error::UnknownIdentity(id))
    }

    /// A handle that can interrupt `get` from another thread.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Interrupt a blocked `get`.
    pub fn wake(&self) -> Result<()> {
        self.waker.wake()
    }

    /// Register `connection` with `interest` and wake any blocked `get`.
    ///
    /// Fails with [`Error::Capacity`] when full and [`Error::Duplicate`]
    /// when the identity is already present. A connection whose descriptor
    /// is already closed is refused, since its number may belong to another
    /// socket by now. On failure the registry is unchanged and the
    /// connection is dropped (which shuts it down).
    pub fn add(&self, connection: ActiveConnection, interest: Interest) -> Result<Identity> {
        self.add_shared(Arc::new(connection), interest)
    }

    /// Like [`ConnectionRegistry::add`] for a connection the caller also
    /// keeps a reference to, so a rejected connection is not lost.
    pub fn add_shared(&self, connection: ConnectionRef, interest: Interest) -> Result<Identity> {
        let id = connection.id();
        if !connection.stream().is_open() {
            warn!(%id, "refusing connection with a closed descriptor");
            return Err(sockpool_fd::Error::EmptyHandle.into());
        }
        {
            let mut state = self.state.lock();
            if state.entries.len() >= state.capacity {
                warn!(%id, capacity = state.capacity, "registry full, rejecting connection");
                return Err(Error::Capacity {
                    capacity: state.capacity,
                });
            }
            if state.entries.contains_key(&id) {
                return Err(Error::Duplicate(id));
            }
            state.entries.insert(
                id,
                Entry {
                    connection,
                    interest,
                },
            );
        }
        if let Err(err) = self.waker.wake() {
            self.state.lock().entries.remove(&id);
            return Err(err);
        }
        debug!(%id, ?interest, "registered connection");
        Ok(id)
    }

    /// Change what is watched for `id`. Takes effect on the next `get`.
    pub fn set(&self, id: Identity, interest: Interest) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(Error::UnknownIdentity(id))?;
        entry.interest = interest;
        trace!(%id, ?interest, "interest updated");
        Ok(())
    }

    /// Deregister `id` and hand the connection back.
    ///
    /// The connection shuts down when the last reference to it is dropped.
    pub fn remove(&self, id: Identity) -> Result<ConnectionRef> {
        let entry = self
            .state
            .lock()
            .entries
            .remove(&id)
            .ok_or(Error::UnknownIdentity(id))?;
        if let Err(err) = self.waker.wake() {
            warn!(%id, error = %err, "failed to wake poller after remove");
        }
        debug!(%id, "deregistered connection");
        Ok(entry.connection)
    }

    /// Wait up to `timeout` (forever for `None`) for registered connections
    /// to become ready and return them with what was observed.
    ///
    /// A timeout, an interrupted wait or a wake-up with nothing else ready
    /// all return an empty batch. Any other `poll(2)` failure is returned.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Vec<ReadyConnection>> {
        let mut fds = self.snapshot();

        let ready = match poll(&mut fds, timeout) {
            Ok(ready) => ready,
            Err(sockpool_fd::Error::Poll(err)) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => {
                self.restore(fds);
                return Err(err.into());
            }
        };
        if ready == 0 {
            self.restore(fds);
            return Ok(Vec::new());
        }

        if fds[0].revents != 0 {
            match self.drain_wakeups() {
                Ok(drained) => trace!(drained, "consumed wake-ups"),
                Err(err) => {
                    self.restore(fds);
                    return Err(err);
                }
            }
        }

        let mut state = self.state.lock();
        let mut batch = Vec::with_capacity(ready);
        for pfd in fds.iter().skip(1).filter(|pfd| pfd.revents != 0) {
            let id = Identity::from(pfd.fd);
            match state.entries.get(&id) {
                Some(entry) => batch.push(ReadyConnection {
                    connection: Arc::clone(&entry.connection),
                    events: Readiness::from_bits_truncate(pfd.revents),
                }),
                None => trace!(%id, "connection removed while polling"),
            }
        }
        Self::keep_scratch(&mut state, fds);
        trace!(ready = batch.len(), "poll batch");
        Ok(batch)
    }

    fn snapshot(&self) -> Vec<pollfd> {
        let mut state = self.state.lock();
        let mut fds = std::mem::take(&mut state.scratch);
        fds.clear();
        fds.reserve(state.entries.len() + 1);
        fds.push(pollfd {
            fd: self.wake_rx.as_raw_file_descriptor(),
            events: POLLIN,
            revents: 0,
        });
        fds.extend(state.entries.iter().map(|(id, entry)| pollfd {
            fd: id.raw(),
            events: entry.interest.bits(),
            revents: 0,
        }));
        fds
    }

    fn restore(&self, fds: Vec<pollfd>) {
        Self::keep_scratch(&mut self.state.lock(), fds);
    }

    // Concurrent gets each take their own buffer; keep the biggest.
    fn keep_scratch(state: &mut State, fds: Vec<pollfd>) {
        if fds.capacity() >= state.scratch.capacity() {
            state.scratch = fds;
        }
    }

    fn drain_wakeups(&self) -> Result<usize> {
        let mut buf = [0u8; 64];
        let mut drained = 0;
        loop {
            match self.wake_rx.handle().read_bytes(&mut buf) {
                Ok(0) => return Ok(drained),
                Ok(n) => drained += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(drained),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::os("read", err)),
            }
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionRegistry")
            .field("len", &state.entries.len())
            .field("capacity", &state.capacity)
            .field("wake_rx", &self.wake_rx)
            .finish_non_exhaustive()
    }
}
