//! Host-facing channel handle over a shared [`Queue`].
use crate::error::{Error, Result};
use crate::poller;
use crate::poller::{Deadline, EventId};
use crate::queue::{PushOutcome, Queue, Token};
use crate::unwrap_poison;
use crate::value::Value;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of [`Channel::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushResult {
    /// The value was accepted. On a rendezvous channel this additionally
    /// means a consumer took it.
    Pushed,
    /// The wait budget ran out; nothing was delivered.
    TimedOut,
}

/// Outcome of [`Channel::pop`].
#[derive(Debug, PartialEq)]
pub enum PopResult {
    /// The head value.
    Popped(Value),
    /// The queue stayed empty for the whole wait budget.
    TimedOut,
}

impl PopResult {
    /// The popped value, if any.
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Popped(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// Which readiness fd to wait on.
#[derive(Debug, Clone, Copy)]
enum Side {
    /// Wait until the queue holds an item.
    Readable,
    /// Wait until the queue has room.
    Writable,
}

/// Live part of a channel: gone after `close`.
#[derive(Debug)]
struct Inner {
    /// The shared queue; this handle's reference.
    queue: Arc<Queue>,
    /// Cached poller event for the readable fd.
    rd_event: Option<EventId>,
    /// Cached poller event for the writable fd.
    wr_event: Option<EventId>,
}

/// A channel endpoint.
///
/// Values are encoded into queue items on push and decoded on pop. Several
/// handles may point at one queue (each holding its own reference), so
/// channels are multi-producer multi-consumer. A capacity-1 channel is a
/// rendezvous: `push` reports success only once the value was consumed.
#[derive(Debug)]
pub struct Channel {
    /// `None` once closed. Closing drops the queue reference.
    inner: Mutex<Option<Inner>>,
}

impl Channel {
    /// Creates a channel over a fresh queue of the given capacity.
    /// A capacity of 0 is treated as 1 (rendezvous).
    /// # Errors
    /// If the OS refuses to hand out pipes.
    pub fn new(max_items: usize) -> Result<Self> {
        Ok(Self::from_queue(Queue::new(max_items)?))
    }

    /// Wraps an existing queue reference in a new handle.
    pub(crate) fn from_queue(queue: Arc<Queue>) -> Self {
        Self {
            inner: Mutex::new(Some(Inner {
                queue,
                rd_event: None,
                wr_event: None,
            })),
        }
    }

    /// A new handle onto the same queue, with its own reference.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_queue(self.queue()?))
    }

    /// Pushes a value, waiting up to `timeout` for room (and, on a
    /// rendezvous channel, for a consumer). `None` waits forever; a zero
    /// timeout makes exactly one non-blocking attempt.
    ///
    /// A timed-out rendezvous push revokes the value: either the item is
    /// still queued and gets removed, or a consumer already took it, in
    /// which case the push counts as delivered after all.
    /// # Errors
    /// [`Error::Closed`] after `close`; otherwise propagated pipe or wait
    /// failures.
    pub fn push(&self, value: impl Into<Value>, timeout: Option<Duration>) -> Result<PushResult> {
        let queue = self.queue()?;
        let deadline = Deadline::new(timeout);
        let rendezvous = queue.max_items() == 1;
        let mut data = value.into().encode();
        loop {
            match queue.push(data)? {
                PushOutcome::Pushed(token) => {
                    if !rendezvous {
                        return Ok(PushResult::Pushed);
                    }
                    return self.finish_rendezvous(&queue, token, &deadline);
                }
                PushOutcome::Full(returned) => {
                    data = returned;
                    if !self.wait_ready(Side::Writable, &deadline)? {
                        return Ok(PushResult::TimedOut);
                    }
                }
            }
        }
    }

    /// Second half of a rendezvous push: the writable edge fires once the
    /// single slot drains, i.e. once a consumer took our value.
    fn finish_rendezvous(
        &self,
        queue: &Arc<Queue>,
        token: Token,
        deadline: &Deadline,
    ) -> Result<PushResult> {
        if self.wait_ready(Side::Writable, deadline)? {
            return Ok(PushResult::Pushed);
        }
        if queue.pop_match(token)? {
            return Ok(PushResult::TimedOut);
        }
        // The item is gone, so a consumer won the race against the timeout.
        Ok(PushResult::Pushed)
    }

    /// Pops the head value, waiting up to `timeout` for one to arrive.
    /// `None` waits forever; a zero timeout makes one non-blocking attempt.
    /// # Errors
    /// [`Error::Closed`] after `close`; otherwise propagated pipe or wait
    /// failures.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<PopResult> {
        let queue = self.queue()?;
        let deadline = Deadline::new(timeout);
        loop {
            if let Some(data) = queue.pop()? {
                return Ok(PopResult::Popped(Value::decode(&data)?));
            }
            if !self.wait_ready(Side::Readable, &deadline)? {
                return Ok(PopResult::TimedOut);
            }
        }
    }

    /// Closes the handle: drops the queue reference and disposes any cached
    /// poller events. Idempotent. Later operations fail with [`Error::Closed`].
    /// # Errors
    /// In case of poisoned mutex.
    pub fn close(&self) -> Result<()> {
        let inner = unwrap_poison(self.inner.lock())?.take();
        if let Some(inner) = inner {
            if let Some(poller) = poller::registered() {
                if let Some(id) = inner.rd_event {
                    poller.dispose_event(id);
                }
                if let Some(id) = inner.wr_event {
                    poller.dispose_event(id);
                }
            }
        }
        Ok(())
    }

    /// Current number of queued items.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn len(&self) -> Result<usize> {
        self.queue()?.len()
    }

    /// Whether the queue currently holds nothing.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn is_empty(&self) -> Result<bool> {
        self.queue()?.is_empty()
    }

    /// Total encoded bytes currently queued.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn size(&self) -> Result<usize> {
        self.queue()?.size()
    }

    /// The queue capacity in items.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn max_items(&self) -> Result<usize> {
        Ok(self.queue()?.max_items())
    }

    /// Number of live references to the underlying queue.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn nref(&self) -> Result<usize> {
        let queue = self.queue()?;
        // This handle's temporary clone must not show up in the answer.
        Ok(queue.nref() - 1)
    }

    /// Fd that is readable exactly while the queue holds items.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn fd_readable(&self) -> Result<RawFd> {
        Ok(self.queue()?.fd_readable())
    }

    /// Fd that is readable exactly while the queue has room.
    /// # Errors
    /// [`Error::Closed`] after `close`.
    pub fn fd_writable(&self) -> Result<RawFd> {
        Ok(self.queue()?.fd_writable())
    }

    /// The queue reference, or [`Error::Closed`].
    fn queue(&self) -> Result<Arc<Queue>> {
        unwrap_poison(self.inner.lock())?
            .as_ref()
            .map(|inner| Arc::clone(&inner.queue))
            .ok_or(Error::Closed)
    }

    /// Waits on one of the readiness fds, going through the injected poller
    /// when one is available and caching its event handles.
    fn wait_ready(&self, side: Side, deadline: &Deadline) -> Result<bool> {
        if deadline.expired() {
            return Ok(false);
        }
        let pollable = poller::registered().filter(|p| p.is_pollable());
        let (fd, event) = {
            let mut guard = unwrap_poison(self.inner.lock())?;
            let inner = guard.as_mut().ok_or(Error::Closed)?;
            let fd = match side {
                Side::Readable => inner.queue.fd_readable(),
                Side::Writable => inner.queue.fd_writable(),
            };
            let mut event = None;
            if let Some(poller) = pollable {
                let slot = match side {
                    Side::Readable => &mut inner.rd_event,
                    Side::Writable => &mut inner.wr_event,
                };
                if slot.is_none() {
                    *slot = poller.new_event(fd);
                }
                event = *slot;
            }
            (fd, event)
        };
        match (pollable, event) {
            (Some(poller), Some(id)) => poller.wait_event(id, deadline.remaining()),
            (Some(poller), None) => poller.wait_readable(fd, deadline.remaining()),
            (None, _) => poller::block_on_readable(fd, deadline),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Close if the host did not; poller events must not leak.
        let _ = self.close();
    }
}
