use crate::{
    timeout_millis, AsRawFileDescriptor, Error, FileDescriptor, FromRawFileDescriptor,
    IntoRawFileDescriptor, OwnedHandle, Pipe, Result,
};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

pub use libc::{pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

pub type RawFileDescriptor = RawFd;

/// The value held by an `OwnedHandle` that owns nothing.
pub const EMPTY_HANDLE: RawFileDescriptor = -1;

impl<T: AsRawFd> AsRawFileDescriptor for T {
    fn as_raw_file_descriptor(&self) -> RawFileDescriptor {
        self.as_raw_fd()
    }
}

impl<T: IntoRawFd> IntoRawFileDescriptor for T {
    fn into_raw_file_descriptor(self) -> RawFileDescriptor {
        self.into_raw_fd()
    }
}

impl<T: FromRawFd> FromRawFileDescriptor for T {
    unsafe fn from_raw_file_descriptor(fd: RawFileDescriptor) -> Self {
        Self::from_raw_fd(fd)
    }
}

pub(crate) fn close_raw(fd: RawFd) -> Result<()> {
    if unsafe { libc::close(fd) } == -1 {
        Err(Error::Close {
            fd: fd.into(),
            source: io::Error::last_os_error(),
        })
    } else {
        Ok(())
    }
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(Error::Cloexec(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(Error::Cloexec(io::Error::last_os_error()));
    }
    Ok(())
}

impl OwnedHandle {
    pub(crate) fn dup_impl(fd: RawFd) -> Result<Self> {
        let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if duped == -1 {
            Err(Error::Dup {
                fd: fd.into(),
                source: io::Error::last_os_error(),
            })
        } else {
            Ok(Self { handle: duped })
        }
    }

    pub(crate) fn redirect_impl(&mut self, src: RawFd) -> Result<()> {
        if unsafe { libc::dup2(src, self.handle) } == -1 {
            return Err(Error::Dup2 {
                src_fd: src.into(),
                dest_fd: self.handle.into(),
                source: io::Error::last_os_error(),
            });
        }
        // dup2 clears FD_CLOEXEC on the target
        set_cloexec(self.handle)
    }

    /// One `read(2)` into `buf`.
    pub fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        let size = unsafe { libc::read(self.handle, buf.as_mut_ptr().cast(), buf.len()) };
        if size == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(size as usize)
        }
    }

    /// One `write(2)` from `buf`.
    pub fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        let size = unsafe { libc::write(self.handle, buf.as_ptr().cast(), buf.len()) };
        if size == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(size as usize)
        }
    }

    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.handle, libc::F_GETFL) };
        if flags == -1 {
            return Err(Error::NonBlocking(io::Error::last_os_error()));
        }
        let flags = if non_blocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.handle, libc::F_SETFL, flags) } == -1 {
            return Err(Error::NonBlocking(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(err) = self.reset() {
            tracing::debug!(error = %err, "ignoring close failure while dropping handle");
        }
    }
}

impl AsRawFd for OwnedHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.handle
    }
}

impl IntoRawFd for OwnedHandle {
    fn into_raw_fd(mut self) -> RawFd {
        self.release()
    }
}

impl FromRawFd for OwnedHandle {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { handle: fd }
    }
}

/// # Panics
///
/// Borrowing an empty handle panics; there is no descriptor to lend.
impl AsFd for OwnedHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        assert!(!self.is_empty(), "cannot borrow an empty OwnedHandle");
        unsafe { BorrowedFd::borrow_raw(self.handle) }
    }
}

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl IntoRawFd for FileDescriptor {
    fn into_raw_fd(self) -> RawFd {
        self.handle.into_raw_fd()
    }
}

impl FromRawFd for FileDescriptor {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            handle: OwnedHandle::from_raw_fd(fd),
        }
    }
}

impl AsFd for FileDescriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }
}

impl Read for FileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle.read_bytes(buf)
    }
}

impl Write for FileDescriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle.write_bytes(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for &FileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle.read_bytes(buf)
    }
}

impl Write for &FileDescriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle.write_bytes(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Pipe {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    pub fn new() -> Result<Pipe> {
        let mut fds = [-1 as libc::c_int; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if res == -1 {
            Err(Error::Pipe(io::Error::last_os_error()))
        } else {
            Ok(Self::from_raw_pair(fds))
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    pub fn new() -> Result<Pipe> {
        let mut fds = [-1 as libc::c_int; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if res == -1 {
            return Err(Error::Pipe(io::Error::last_os_error()));
        }
        let pipe = Self::from_raw_pair(fds);
        set_cloexec(pipe.read.as_raw_fd())?;
        set_cloexec(pipe.write.as_raw_fd())?;
        Ok(pipe)
    }

    fn from_raw_pair(fds: [libc::c_int; 2]) -> Pipe {
        let read = FileDescriptor {
            handle: OwnedHandle { handle: fds[0] },
        };
        let write = FileDescriptor {
            handle: OwnedHandle { handle: fds[1] },
        };
        Pipe { read, write }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn socketpair_impl() -> Result<(FileDescriptor, FileDescriptor)> {
    let mut fds = [-1i32; 2];
    let res = unsafe {
        libc::socketpair(
            libc::PF_LOCAL,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if res == -1 {
        Err(Error::Socketpair(io::Error::last_os_error()))
    } else {
        let read = FileDescriptor {
            handle: OwnedHandle { handle: fds[0] },
        };
        let write = FileDescriptor {
            handle: OwnedHandle { handle: fds[1] },
        };
        Ok((read, write))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn socketpair_impl() -> Result<(FileDescriptor, FileDescriptor)> {
    let mut fds = [-1i32; 2];
    let res = unsafe { libc::socketpair(libc::PF_LOCAL, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if res == -1 {
        Err(Error::Socketpair(io::Error::last_os_error()))
    } else {
        let read = FileDescriptor {
            handle: OwnedHandle { handle: fds[0] },
        };
        let write = FileDescriptor {
            handle: OwnedHandle { handle: fds[1] },
        };
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
        Ok((read, write))
    }
}

pub(crate) fn poll_impl(pfd: &mut [pollfd], duration: Option<Duration>) -> Result<usize> {
    let poll_result = unsafe {
        libc::poll(
            pfd.as_mut_ptr(),
            pfd.len() as libc::nfds_t,
            timeout_millis(duration),
        )
    };
    if poll_result < 0 {
        Err(Error::Poll(io::Error::last_os_error()))
    } else {
        Ok(poll_result as usize)
    }
}
