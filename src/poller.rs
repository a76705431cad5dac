//! Cooperative poller injection and the blocking `poll(2)` fallback.
//!
//! The runtime never hard-codes a host concurrency model. Every fd wait asks
//! the process-global registry first: if the host installed a [`Poller`] and
//! it reports itself pollable, the wait is delegated (the host may suspend a
//! cooperative task instead of parking the OS thread). Otherwise the calling
//! thread parks in a plain `poll(2)`.
use crate::error::{Error, Result};
use std::io;
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Identifier of a host-side event handle created by [`Poller::new_event`].
pub type EventId = u64;

/// A host event loop that can wait for fd readability on our behalf.
///
/// `wait_readable` is the only mandatory wait. The event-handle trio lets
/// hosts that register fds once (epoll-style) avoid re-registering on every
/// wait; channels cache the returned ids and dispose them on close.
pub trait Poller: Send + Sync {
    /// Whether delegation is currently possible. A host may say no outside
    /// of its event-loop context; the wait then falls back to blocking.
    fn is_pollable(&self) -> bool;

    /// Waits until `fd` is readable. Returns `false` on timeout.
    /// # Errors
    /// Host-defined wait failures.
    fn wait_readable(&self, fd: RawFd, timeout: Option<Duration>) -> Result<bool>;

    /// Creates a reusable event handle for `fd`, if the host supports them.
    fn new_event(&self, _fd: RawFd) -> Option<EventId> {
        None
    }

    /// Waits on a handle from [`Poller::new_event`]. Returns `false` on timeout.
    /// # Errors
    /// Host-defined wait failures; by default event handles are unsupported.
    fn wait_event(&self, _id: EventId, _timeout: Option<Duration>) -> Result<bool> {
        Err(Error::InvalidArgument("poller has no event support"))
    }

    /// Releases a handle from [`Poller::new_event`].
    fn dispose_event(&self, _id: EventId) {}
}

/// The process-wide poller. Installed at most once.
static POLLER: OnceLock<Box<dyn Poller>> = OnceLock::new();

/// Installs the process-wide cooperative poller.
/// Returns `false` if one was already installed; the new one is dropped.
pub fn set_poller(poller: Box<dyn Poller>) -> bool {
    POLLER.set(poller).is_ok()
}

/// The installed poller, if any.
pub(crate) fn registered() -> Option<&'static dyn Poller> {
    POLLER.get().map(Box::as_ref)
}

/// A wait budget derived from an optional timeout.
/// `None` timeout means wait forever; a zero timeout is already expired and
/// yields exactly one non-blocking attempt in the loops built on top.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    /// Absolute expiry, `None` for an unbounded wait.
    at: Option<Instant>,
}

impl Deadline {
    /// Starts the budget now. A timeout too large to represent is treated
    /// as unbounded.
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    /// Whether the budget is used up.
    pub(crate) fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, `None` for unbounded. Saturates at zero.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Time left as a `poll(2)` millisecond argument.
    fn poll_ms(&self) -> libc::c_int {
        match self.remaining() {
            None => -1,
            Some(rem) => {
                // Round up so a 0 < rem < 1ms budget does not busy-spin.
                let ms = rem
                    .as_millis()
                    .saturating_add(u128::from(rem.subsec_nanos() % 1_000_000 != 0));
                libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
            }
        }
    }
}

/// Waits until `fd` becomes readable, consulting the injected poller first.
/// Returns `false` on deadline expiry.
pub(crate) fn wait_readable(fd: RawFd, deadline: &Deadline) -> Result<bool> {
    if deadline.expired() {
        return Ok(false);
    }
    if let Some(poller) = registered() {
        if poller.is_pollable() {
            return poller.wait_readable(fd, deadline.remaining());
        }
    }
    block_on_readable(fd, deadline)
}

/// The blocking fallback: parks in `poll(2)` until POLLIN or expiry.
/// EINTR restarts the wait with a recomputed budget.
pub(crate) fn block_on_readable(fd: RawFd, deadline: &Deadline) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, deadline.poll_ms()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                if deadline.expired() {
                    return Ok(false);
                }
                continue;
            }
            return Err(err.into());
        }
        if rc == 0 {
            // poll() timed out; the budget may have been clamped, re-check.
            if deadline.expired() {
                return Ok(false);
            }
            continue;
        }
        // POLLHUP/POLLERR are surfaced as readable so the caller's next read
        // observes the condition instead of blocking forever.
        return Ok(true);
    }
}
