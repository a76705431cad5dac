//! Worker thread handles: host-side lifecycle control and the worker-side
//! self handle.
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::pipe;
use crate::pipe::OneByte;
use crate::poller;
use crate::poller::Deadline;
use crate::unwrap_poison;
use log::{debug, warn};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on a captured worker error message, in bytes.
pub const ERRMSG_MAX: usize = 1024;

/// Where a worker is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// The worker thread is still executing.
    Running,
    /// The worker body returned normally.
    Terminated,
    /// The worker unwound after a cancellation request, or never completed
    /// its protected invocation.
    Cancelled,
    /// The worker body raised; the captured message is bounded by
    /// [`ERRMSG_MAX`].
    Failed(String),
}

impl Status {
    /// A `Failed` status with the message truncated to fit the bound.
    pub(crate) fn failed(mut msg: String) -> Self {
        if msg.len() >= ERRMSG_MAX {
            let mut cut = ERRMSG_MAX - 1;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg.truncate(cut);
        }
        Self::Failed(msg)
    }

    /// The conventional lowercase label for this state.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether the worker is still executing.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Outcome of [`Thread::join`].
#[derive(Debug, PartialEq, Eq)]
pub enum JoinResult {
    /// The worker terminated and its OS thread has been reaped.
    Joined,
    /// The worker was still running when the wait budget ran out.
    TimedOut,
}

/// State shared between the host handle and the worker.
#[derive(Debug)]
pub(crate) struct Shared {
    /// Written once by the worker's cleanup, read by the host.
    status: Mutex<Status>,
    /// Set by a hard cancel; engines poll it at their cancellation points.
    hard: AtomicBool,
    /// Latched once the worker observed the cancellation signal.
    seen: AtomicBool,
}

impl Shared {
    /// Fresh state for a worker about to start.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Status::Running),
            hard: AtomicBool::new(false),
            seen: AtomicBool::new(false),
        })
    }

    /// Current status snapshot.
    fn status(&self) -> Result<Status> {
        Ok(unwrap_poison(self.status.lock())?.clone())
    }

    /// Records the terminal status. Runs inside the worker cleanup, so a
    /// poisoned lock is recovered rather than propagated.
    pub(crate) fn set_status(&self, status: Status) {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = status;
    }

    /// Whether a hard cancel was requested.
    pub(crate) fn hard_requested(&self) -> bool {
        self.hard.load(Ordering::SeqCst)
    }
}

/// The worker's own handle: what a script sees as "self".
#[derive(Debug)]
pub struct WorkerHandle {
    /// Read end of the cancellation pipe; lives and dies with the worker.
    cancel_read: OwnedFd,
    /// Lifecycle state shared with the host.
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Wires up the worker side.
    pub(crate) fn new(cancel_read: OwnedFd, shared: Arc<Shared>) -> Self {
        Self {
            cancel_read,
            shared,
        }
    }

    /// Fd the worker can `select` on to learn of its own cancellation.
    pub fn fd_cancel(&self) -> RawFd {
        self.cancel_read.as_raw_fd()
    }

    /// Non-blocking check of the cancellation pipe. Once a signal byte was
    /// observed (or the host end is gone) this stays true.
    pub fn is_cancelled(&self) -> bool {
        if self.shared.seen.load(Ordering::SeqCst) {
            return true;
        }
        match pipe::read_one(self.cancel_read.as_raw_fd()) {
            Ok(OneByte::Byte(_) | OneByte::Closed) => {
                self.shared.seen.store(true, Ordering::SeqCst);
                true
            }
            Ok(OneByte::WouldBlock) => false,
            Err(err) => {
                warn!("cancellation pipe read failed: {err}");
                false
            }
        }
    }

    /// Whether the host asked for a hard cancel. Engines check this at
    /// their cancellation points and unwind with the interrupt sentinel.
    pub fn hard_cancelled(&self) -> bool {
        self.shared.hard_requested()
    }
}

/// The worker's argument list: its self handle first, then the channels
/// handed over at spawn time.
#[derive(Debug)]
pub struct WorkerContext {
    /// The "self" argument.
    worker: WorkerHandle,
    /// Channel handles cloned into this worker.
    channels: Vec<Channel>,
}

impl WorkerContext {
    /// Bundles the worker-side arguments.
    pub(crate) fn new(worker: WorkerHandle, channels: Vec<Channel>) -> Self {
        Self { worker, channels }
    }

    /// The worker's self handle.
    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// All channels handed over at spawn, in argument order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// One channel by argument position.
    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Shorthand for [`WorkerHandle::hard_cancelled`].
    pub fn hard_cancelled(&self) -> bool {
        self.worker.hard_cancelled()
    }
}

/// Host-side handle to a spawned worker.
///
/// Dropping the handle without a successful join cancels the worker and
/// joins it, so a worker can never outlive every way of observing it.
#[derive(Debug)]
pub struct Thread {
    /// OS join handle; taken by the successful join.
    handle: Option<JoinHandle<()>>,
    /// Read end of the termination pipe; `None` once joined.
    term_read: Option<OwnedFd>,
    /// Write end of the cancellation pipe; closed by a notify cancel.
    cancel_write: Mutex<Option<OwnedFd>>,
    /// Lifecycle state shared with the worker.
    shared: Arc<Shared>,
}

impl Thread {
    /// Assembles the host handle once the worker thread is running.
    pub(crate) fn assemble(
        handle: JoinHandle<()>,
        term_read: OwnedFd,
        cancel_write: OwnedFd,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            handle: Some(handle),
            term_read: Some(term_read),
            cancel_write: Mutex::new(Some(cancel_write)),
            shared,
        }
    }

    /// Waits for the worker to terminate, then reaps its OS thread.
    ///
    /// The first successful call consumes the termination byte and closes
    /// the pipe; any later call returns [`JoinResult::Joined`] immediately.
    /// `None` waits forever; a zero timeout makes one non-blocking attempt.
    /// # Errors
    /// [`Error::Internal`] if the termination protocol was violated;
    /// otherwise propagated wait failures.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<JoinResult> {
        let Some(fd) = self.term_read.as_ref().map(AsRawFd::as_raw_fd) else {
            return Ok(JoinResult::Joined);
        };
        let deadline = Deadline::new(timeout);
        loop {
            match pipe::read_one(fd) {
                Ok(OneByte::Byte(pipe::SIGNAL_BYTE)) => return self.finish_join(),
                Ok(OneByte::Byte(_)) => {
                    return Err(Error::Internal("unexpected termination byte"))
                }
                Ok(OneByte::Closed) => {
                    return Err(Error::Internal("termination pipe closed without terminator"))
                }
                Ok(OneByte::WouldBlock) => {
                    if !poller::wait_readable(fd, &deadline)? {
                        return Ok(JoinResult::TimedOut);
                    }
                }
                Err(err) => {
                    // The fd was yanked from under us; if the worker already
                    // reached a terminal state the OS join alone is enough.
                    if err.raw_os_error() == Some(libc::EBADF)
                        && !self.shared.status()?.is_running()
                    {
                        return self.finish_join();
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// Reaps the OS thread and retires the termination pipe.
    fn finish_join(&mut self) -> Result<JoinResult> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                // Status was already recorded by the cleanup before the
                // unwind reached the thread boundary.
                warn!("worker thread panicked");
            }
        }
        self.term_read = None;
        debug!("worker joined, status {:?}", self.shared.status());
        Ok(JoinResult::Joined)
    }

    /// Requests worker termination. Returns `Ok` even if the worker already
    /// terminated; re-issuing either form is harmless.
    ///
    /// With `notify` false this is a hard cancel: the hard flag is raised
    /// and the cancellation pipe signalled; the engine unwinds at its next
    /// cancellation point and the worker ends `Cancelled`. With `notify`
    /// true only the pipe is signalled (and its write end closed); a worker
    /// that polls `is_cancelled` exits normally and ends `Terminated`.
    /// # Errors
    /// In case of poisoned mutex or a failed pipe write.
    pub fn cancel(&self, notify: bool) -> Result<()> {
        if !self.shared.status()?.is_running() {
            return Ok(());
        }
        if !notify {
            self.shared.hard.store(true, Ordering::SeqCst);
        }
        let mut guard = unwrap_poison(self.cancel_write.lock())?;
        if let Some(fd) = guard.as_ref() {
            pipe::write_one(fd.as_raw_fd(), pipe::SIGNAL_BYTE)?;
            debug!("cancel requested (notify: {notify})");
            if notify {
                // Closing the write end lets the worker see EOF after the
                // byte, a second, unlosable signal.
                *guard = None;
            }
        }
        Ok(())
    }

    /// Current status. `Failed` carries the captured error message.
    /// # Errors
    /// In case of poisoned mutex.
    pub fn status(&self) -> Result<Status> {
        self.shared.status()
    }

    /// The termination pipe's read fd for external event loops, or -1 once
    /// the worker was joined.
    pub fn fd(&self) -> RawFd {
        self.term_read.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.term_read.is_none() {
            return;
        }
        let _ = self.cancel(false);
        if let Err(err) = self.join(None) {
            warn!("implicit join on drop failed: {err}");
        }
    }
}
