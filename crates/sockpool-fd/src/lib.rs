//! The purpose of this crate is to give the rest of sockpool a single place
//! where raw descriptors are owned, duplicated, closed and polled.
//!
//! Everything above this crate deals in `OwnedHandle`, `SharedHandle` and
//! `FileDescriptor` values and never touches a bare `RawFd` directly.
//!
//! ## OwnedHandle
//!
//! An `OwnedHandle` owns exactly one descriptor, or nothing at all. It closes
//! the descriptor exactly once: on `reset`, on `replace`, or on drop,
//! whichever comes first. `release` hands the raw value back to the caller
//! without closing it.
//!
//! ```
//! use sockpool_fd::{OwnedHandle, Pipe, Error};
//!
//! let pipe = Pipe::new()?;
//! let mut handle = OwnedHandle::dup(&pipe.read)?;
//! assert!(!handle.is_empty());
//! handle.reset()?;
//! assert!(handle.is_empty());
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Pipe
//! The `Pipe` type makes it more convenient to create a pipe and manage
//! the lifetime of both the read and write ends of that pipe.
//!
//! ```
//! use sockpool_fd::{Pipe, Error};
//! use std::io::{Read, Write};
//!
//! let mut pipe = Pipe::new()?;
//! pipe.write.write(b"hello")?;
//! drop(pipe.write);
//!
//! let mut s = String::new();
//! pipe.read.read_to_string(&mut s)?;
//! assert_eq!(s, "hello");
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Polling
//! `poll` is a very thin wrapper around `poll(2)`: level triggered, one
//! `pollfd` per descriptor, `revents` filled in on return.
//!
//! ```
//! use sockpool_fd::*;
//! use std::time::Duration;
//! use std::io::Write;
//!
//! let (a, mut b) = sockpool_fd::socketpair()?;
//! let mut poll_array = [pollfd {
//!    fd: a.as_raw_file_descriptor(),
//!    events: POLLIN,
//!    revents: 0
//! }];
//! // sleeps for 20 milliseconds because `a` is not yet ready
//! assert_eq!(poll(&mut poll_array, Some(Duration::from_millis(20)))?, 0);
//!
//! b.write(b"hello")?;
//!
//! // Now a is ready for read
//! assert_eq!(poll(&mut poll_array, Some(Duration::from_millis(20)))?, 1);
//!
//! # Ok::<(), Error>(())
//! ```

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use crate::unix::*;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to create a pipe")]
    Pipe(#[source] std::io::Error),
    #[error("failed to create a socketpair")]
    Socketpair(#[source] std::io::Error),
    #[error("close of fd {fd} failed")]
    Close { fd: i64, source: std::io::Error },
    #[error("failed to set cloexec")]
    Cloexec(#[source] std::io::Error),
    #[error("failed to change non-blocking mode")]
    NonBlocking(#[source] std::io::Error),
    #[error("poll failed")]
    Poll(#[source] std::io::Error),
    #[error("dup of fd {fd} failed")]
    Dup { fd: i64, source: std::io::Error },
    #[error("dup of fd {src_fd} to fd {dest_fd} failed")]
    Dup2 {
        src_fd: i64,
        dest_fd: i64,
        source: std::io::Error,
    },
    #[error("operation on an empty handle")]
    EmptyHandle,

    #[error("IoError")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The OS error that caused this failure, if there was one.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Pipe(err)
            | Self::Socketpair(err)
            | Self::Cloexec(err)
            | Self::NonBlocking(err)
            | Self::Poll(err)
            | Self::Io(err) => Some(err),
            Self::Close { source, .. } | Self::Dup { source, .. } | Self::Dup2 { source, .. } => {
                Some(source)
            }
            Self::EmptyHandle => None,
        }
    }

    /// Shorthand for `io_error().and_then(raw_os_error)`.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().and_then(std::io::Error::raw_os_error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// `AsRawFileDescriptor` returns a non-owning copy of the underlying
/// descriptor value.
pub trait AsRawFileDescriptor {
    fn as_raw_file_descriptor(&self) -> RawFileDescriptor;
}

/// `IntoRawFileDescriptor` converts an instance into the underlying
/// descriptor value, giving up ownership without closing it.
pub trait IntoRawFileDescriptor {
    fn into_raw_file_descriptor(self) -> RawFileDescriptor;
}

/// `FromRawFileDescriptor` creates an instance from a raw descriptor value.
/// Because a raw descriptor has no inherent ownership management, the
/// `from_raw_file_descriptor` function is marked as unsafe.
pub trait FromRawFileDescriptor {
    /// Construct `Self` from a raw file descriptor, taking ownership.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `fd` is a valid, open file descriptor and
    /// that ownership is transferred to the returned value. After calling
    /// this function, the caller must not close or otherwise use `fd`
    /// independently of the returned value.
    unsafe fn from_raw_file_descriptor(fd: RawFileDescriptor) -> Self;
}

/// `OwnedHandle` is the single owner of one descriptor.
///
/// The empty state (`EMPTY_HANDLE`) is always valid; closing an empty handle
/// is a no-op. Moving an `OwnedHandle` moves ownership, and there is no
/// `Clone`: use `try_clone` to get a second descriptor referring to the same
/// kernel object.
#[derive(Debug)]
pub struct OwnedHandle {
    handle: RawFileDescriptor,
}

impl OwnedHandle {
    /// Create a new handle from some object that is convertible into
    /// the system `RawFileDescriptor` type.  This consumes the parameter
    /// and replaces it with an `OwnedHandle` instance.
    pub fn new<F: IntoRawFileDescriptor>(f: F) -> Self {
        Self {
            handle: f.into_raw_file_descriptor(),
        }
    }

    /// A handle that owns nothing.
    pub const fn empty() -> Self {
        Self {
            handle: EMPTY_HANDLE,
        }
    }

    /// The raw descriptor, or `EMPTY_HANDLE`.
    pub fn get(&self) -> RawFileDescriptor {
        self.handle
    }

    pub fn is_empty(&self) -> bool {
        self.handle == EMPTY_HANDLE
    }

    /// Give up ownership without closing. The handle becomes empty and the
    /// caller is now responsible for the returned descriptor.
    pub fn release(&mut self) -> RawFileDescriptor {
        std::mem::replace(&mut self.handle, EMPTY_HANDLE)
    }

    /// Close the owned descriptor now, reporting the OS error if `close(2)`
    /// fails. The handle is empty afterwards either way.
    pub fn reset(&mut self) -> Result<()> {
        let fd = self.release();
        if fd == EMPTY_HANDLE {
            return Ok(());
        }
        close_raw(fd)
    }

    /// Close the owned descriptor (if any) and take ownership of `other`.
    pub fn replace(&mut self, mut other: OwnedHandle) -> Result<()> {
        let result = self.reset();
        self.handle = other.release();
        result
    }

    /// Attempt to duplicate the underlying handle and return an
    /// `OwnedHandle` wrapped around the duplicate.
    /// The returned handle has a separate lifetime from the source, but
    /// references the same object at the kernel level.
    pub fn try_clone(&self) -> Result<Self> {
        Self::dup(self)
    }

    /// Duplicate the descriptor of any object that exposes one.
    pub fn dup<F: AsRawFileDescriptor>(f: &F) -> Result<Self> {
        Self::dup_impl(f.as_raw_file_descriptor())
    }

    /// Make this handle's descriptor number refer to the same kernel object
    /// as `src`, via `dup2(2)`. The previous object behind the number is
    /// released by the kernel; the number itself is unchanged, so anything
    /// keyed on it stays valid.
    pub fn redirect_from<F: AsRawFileDescriptor>(&mut self, src: &F) -> Result<()> {
        if self.is_empty() {
            return Err(Error::EmptyHandle);
        }
        self.redirect_impl(src.as_raw_file_descriptor())
    }
}

impl Default for OwnedHandle {
    fn default() -> Self {
        Self::empty()
    }
}

/// Reference counted ownership of a single descriptor.
///
/// The descriptor is closed when the last clone is dropped. This is for the
/// rare case where two independently lived objects must both be able to use
/// the same descriptor, such as a wake-up pipe shared between a registry and
/// the wakers it hands out.
#[derive(Debug, Clone)]
pub struct SharedHandle {
    inner: Arc<OwnedHandle>,
}

impl SharedHandle {
    pub fn new(handle: OwnedHandle) -> Self {
        Self {
            inner: Arc::new(handle),
        }
    }

    /// Number of live clones, including this one.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Recover exclusive ownership if this is the last clone.
    pub fn try_unwrap(self) -> std::result::Result<OwnedHandle, Self> {
        Arc::try_unwrap(self.inner).map_err(|inner| Self { inner })
    }
}

impl From<OwnedHandle> for SharedHandle {
    fn from(handle: OwnedHandle) -> Self {
        Self::new(handle)
    }
}

impl std::ops::Deref for SharedHandle {
    type Target = OwnedHandle;
    fn deref(&self) -> &OwnedHandle {
        &self.inner
    }
}

/// `FileDescriptor` is the byte-stream adapter on top of `OwnedHandle`.
/// Every `read` and `write` maps onto exactly one `read(2)`/`write(2)`; wrap
/// it in a `BufReader`/`BufWriter` when buffering is wanted.
///
/// `Read` and `Write` are implemented for `&FileDescriptor` as well, the
/// same way `std::fs::File` does it, so a shared reference is enough to do
/// I/O.
#[derive(Debug)]
pub struct FileDescriptor {
    handle: OwnedHandle,
}

impl FileDescriptor {
    /// Create a new descriptor from some object that is convertible into
    /// the system `RawFileDescriptor` type.  This consumes the parameter
    /// and replaces it with a `FileDescriptor` instance.
    pub fn new<F: IntoRawFileDescriptor>(f: F) -> Self {
        let handle = OwnedHandle::new(f);
        Self { handle }
    }

    pub fn from_handle(handle: OwnedHandle) -> Self {
        Self { handle }
    }

    /// Attempt to duplicate the underlying handle from an object that is
    /// representable as the system `RawFileDescriptor` type and return a
    /// `FileDescriptor` wrapped around the duplicate.
    pub fn dup<F: AsRawFileDescriptor>(f: &F) -> Result<Self> {
        OwnedHandle::dup(f).map(|handle| Self { handle })
    }

    /// Attempt to duplicate the underlying handle and return a
    /// `FileDescriptor` wrapped around the duplicate.
    pub fn try_clone(&self) -> Result<Self> {
        self.handle.try_clone().map(|handle| Self { handle })
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    pub fn into_handle(self) -> OwnedHandle {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_empty()
    }

    /// Close the descriptor now, reporting any error from `close(2)`.
    pub fn close(&mut self) -> Result<()> {
        self.handle.reset()
    }

    /// Attempt to change the non-blocking IO mode of the file descriptor.
    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<()> {
        self.handle.set_non_blocking(non_blocking)
    }
}

/// Represents the readable and writable ends of a pair of descriptors
/// connected via a kernel pipe.
///
/// ```
/// use sockpool_fd::{Pipe, Error};
/// use std::io::{Read,Write};
///
/// let mut pipe = Pipe::new()?;
/// pipe.write.write(b"hello")?;
/// drop(pipe.write);
///
/// let mut s = String::new();
/// pipe.read.read_to_string(&mut s)?;
/// assert_eq!(s, "hello");
/// # Ok::<(), Error>(())
/// ```
#[derive(Debug)]
pub struct Pipe {
    /// The readable end of the pipe
    pub read: FileDescriptor,
    /// The writable end of the pipe
    pub write: FileDescriptor,
}

/// Examines a set of descriptors to see if some of them are ready for I/O,
/// or if certain events have occurred on them.
///
/// If `duration` is `None`, then `poll` will block until any of the requested
/// events are ready.  Otherwise, `duration` specifies how long to wait for
/// readiness before giving up. Sub-millisecond durations are rounded up so
/// that a tiny non-zero timeout never turns into a busy poll.
///
/// The return value is the number of entries that were satisfied; `0` means
/// that none were ready after waiting for the specified duration.
///
/// The `pfd` array is mutated and the `revents` field is updated to indicate
/// which of the events were received. An interrupted wait is reported as
/// `Error::Poll` with `ErrorKind::Interrupted`; callers decide whether to
/// retry.
pub fn poll(pfd: &mut [pollfd], duration: Option<Duration>) -> Result<usize> {
    poll_impl(pfd, duration)
}

/// Create a pair of connected `SOCK_STREAM` unix domain sockets.
pub fn socketpair() -> Result<(FileDescriptor, FileDescriptor)> {
    socketpair_impl()
}

pub(crate) fn timeout_millis(duration: Option<Duration>) -> i32 {
    match duration {
        None => -1,
        Some(d) => {
            let ms = d.as_millis();
            if ms == 0 && !d.is_zero() {
                1
            } else {
                ms.min(i32::MAX as u128) as i32
            }
        }
    }
}
