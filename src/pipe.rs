//! Non-blocking close-on-exec pipes used for readiness and lifecycle signalling.
use std::io;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// The byte carried by every signalling pipe in this crate.
pub(crate) const SIGNAL_BYTE: u8 = b'0';

/// Outcome of a single-byte non-blocking read.
#[derive(Debug)]
pub(crate) enum OneByte {
    /// One byte was consumed.
    Byte(u8),
    /// Nothing is buffered right now.
    WouldBlock,
    /// The write side is closed and the pipe is drained.
    Closed,
}

/// A unidirectional OS pipe with both ends `O_NONBLOCK` and `FD_CLOEXEC`.
#[derive(Debug)]
pub(crate) struct Pipe {
    /// Read end.
    read: OwnedFd,
    /// Write end.
    write: OwnedFd,
}

impl Pipe {
    /// Creates a pipe and puts both ends into non-blocking close-on-exec mode.
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // Wrap immediately so the fds are closed if flag setup fails.
        let pipe = unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        };
        set_nonblock_cloexec(pipe.read.as_raw_fd())?;
        set_nonblock_cloexec(pipe.write.as_raw_fd())?;
        Ok(pipe)
    }

    /// Raw fd of the read end.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Raw fd of the write end.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Makes the read end level-readable by buffering one signal byte.
    /// A pipe that is already armed stays armed.
    pub(crate) fn arm(&self) -> io::Result<()> {
        write_one(self.write_fd(), SIGNAL_BYTE).map(|_| ())
    }

    /// Consumes the buffered signal byte if there is one.
    pub(crate) fn disarm(&self) -> io::Result<bool> {
        match read_one(self.read_fd())? {
            OneByte::Byte(_) => Ok(true),
            OneByte::WouldBlock | OneByte::Closed => Ok(false),
        }
    }

    /// Splits the pipe into its `(read, write)` ends.
    pub(crate) fn into_ends(self) -> (OwnedFd, OwnedFd) {
        (self.read, self.write)
    }
}

/// Sets `O_NONBLOCK` and `FD_CLOEXEC` on a descriptor.
fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
        let fdflags = libc::fcntl(fd, libc::F_GETFD, 0);
        if fdflags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Writes one byte to `fd`. `Ok(false)` means the pipe buffer is full, which
/// for a one-byte signalling protocol means it is already armed.
/// EINTR is retried exactly once.
pub(crate) fn write_one(fd: RawFd, byte: u8) -> io::Result<bool> {
    let mut retried = false;
    loop {
        let rc = unsafe { libc::write(fd, std::ptr::addr_of!(byte).cast(), 1) };
        if rc == 1 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock => return Ok(false),
            ErrorKind::Interrupted if !retried => retried = true,
            _ => return Err(err),
        }
    }
}

/// Reads one byte from `fd` without blocking. EINTR is retried exactly once.
pub(crate) fn read_one(fd: RawFd) -> io::Result<OneByte> {
    let mut byte = 0u8;
    let mut retried = false;
    loop {
        let rc = unsafe { libc::read(fd, std::ptr::addr_of_mut!(byte).cast(), 1) };
        if rc == 1 {
            return Ok(OneByte::Byte(byte));
        }
        if rc == 0 {
            return Ok(OneByte::Closed);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock => return Ok(OneByte::WouldBlock),
            ErrorKind::Interrupted if !retried => retried = true,
            _ => return Err(err),
        }
    }
}
