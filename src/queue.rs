//! The cross-thread bounded FIFO, with readiness visible through pollable fds.
//!
//! Instead of a condition variable, the queue owns two pipes and keeps at
//! most one signal byte buffered in each: one pipe is armed exactly while
//! the queue holds items, the other exactly while it has room. Waiters park
//! in `poll(2)` on the pipe fds (or hand them to an external event loop),
//! so blocking callers and `select`-style hosts share one wake-up protocol.
use crate::error::Result;
use crate::pipe::Pipe;
use crate::unwrap_poison;
use log::trace;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

/// Identity of a pushed item, used to revoke it while it is still queued.
pub type Token = u64;

/// Outcome of [`Queue::push`].
#[derive(Debug)]
pub enum PushOutcome {
    /// Enqueued at the tail. The token identifies the item for [`Queue::pop_match`].
    Pushed(Token),
    /// The queue was full; the item is handed back untouched.
    Full(Box<[u8]>),
}

/// A queued item: the encoded payload plus its revocation identity.
#[derive(Debug)]
struct Item {
    /// Identity for `pop_match`.
    token: Token,
    /// Encoded payload, one allocation.
    data: Box<[u8]>,
}

/// Everything the queue mutex protects, including the readiness bits.
/// The pipe syscalls that transition the bits run under the same lock, so
/// external pollers observe a transition only once it is complete.
#[derive(Debug)]
struct State {
    /// FIFO storage.
    items: VecDeque<Item>,
    /// Total encoded bytes currently held.
    bytes: usize,
    /// Next identity to hand out.
    next_token: Token,
    /// Mirror of "one byte buffered in `read_ready`".
    readable: bool,
    /// Mirror of "one byte buffered in `write_ready`".
    writable: bool,
}

/// A thread-safe bounded FIFO of encoded items.
///
/// The handle is an `Arc`: cloning it is the reference increment every
/// cross-thread hand-off needs, and the last drop releases all remaining
/// items and closes both pipes.
#[derive(Debug)]
pub struct Queue {
    /// Capacity in items, at least 1.
    max_items: usize,
    /// Armed while the queue is non-empty.
    read_ready: Pipe,
    /// Armed while the queue has room.
    write_ready: Pipe,
    /// Guarded book-keeping.
    state: Mutex<State>,
}

impl Queue {
    /// Creates a queue holding up to `max_items` items.
    /// A capacity of 0 is treated as 1, which makes the queue a rendezvous
    /// point. A fresh queue is empty and therefore born writable.
    /// # Errors
    /// If the OS refuses to hand out pipes.
    pub fn new(max_items: usize) -> Result<Arc<Self>> {
        let queue = Self {
            max_items: max_items.max(1),
            read_ready: Pipe::new()?,
            write_ready: Pipe::new()?,
            state: Mutex::new(State {
                items: VecDeque::new(),
                bytes: 0,
                next_token: 0,
                readable: false,
                writable: true,
            }),
        };
        queue.write_ready.arm()?;
        Ok(Arc::new(queue))
    }

    /// Current number of items. A snapshot; stale the moment it returns.
    /// # Errors
    /// In case of poisoned mutex.
    pub fn len(&self) -> Result<usize> {
        Ok(unwrap_poison(self.state.lock())?.items.len())
    }

    /// Whether the queue currently holds nothing.
    /// # Errors
    /// In case of poisoned mutex.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(unwrap_poison(self.state.lock())?.items.is_empty())
    }

    /// Total encoded bytes currently held.
    /// # Errors
    /// In case of poisoned mutex.
    pub fn size(&self) -> Result<usize> {
        Ok(unwrap_poison(self.state.lock())?.bytes)
    }

    /// The capacity in items.
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Number of live references to this queue.
    pub fn nref(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Fd that is level-readable exactly while the queue holds items.
    pub fn fd_readable(&self) -> RawFd {
        self.read_ready.read_fd()
    }

    /// Fd that is level-readable exactly while the queue has room.
    pub fn fd_writable(&self) -> RawFd {
        self.write_ready.read_fd()
    }

    /// Enqueues an item at the tail, or hands it back if the queue is full.
    /// # Errors
    /// In case of poisoned mutex or a failed readiness-pipe syscall.
    pub fn push(&self, data: Box<[u8]>) -> Result<PushOutcome> {
        let mut state = unwrap_poison(self.state.lock())?;
        if state.items.len() >= self.max_items {
            // Full is reported without mutation, but the writable signal is
            // re-checked so a waiter cannot be left with a stale byte.
            if state.writable {
                self.write_ready.disarm()?;
                state.writable = false;
            }
            return Ok(PushOutcome::Full(data));
        }
        let was_empty = state.items.is_empty();
        let token = state.next_token;
        state.next_token = state.next_token.wrapping_add(1);
        state.bytes += data.len();
        state.items.push_back(Item { token, data });
        if was_empty {
            self.read_ready.arm()?;
            state.readable = true;
            trace!("queue readable: armed on first item");
        }
        if state.items.len() == self.max_items {
            self.write_ready.disarm()?;
            state.writable = false;
            trace!("queue writable: disarmed at capacity {}", self.max_items);
        }
        Ok(PushOutcome::Pushed(token))
    }

    /// Dequeues the head item, or `None` if the queue is empty.
    /// # Errors
    /// In case of poisoned mutex or a failed readiness-pipe syscall.
    pub fn pop(&self) -> Result<Option<Box<[u8]>>> {
        let mut state = unwrap_poison(self.state.lock())?;
        let Some(item) = state.items.pop_front() else {
            // Same re-check as the full case of push.
            if state.readable {
                self.read_ready.disarm()?;
                state.readable = false;
            }
            return Ok(None);
        };
        state.bytes -= item.data.len();
        self.after_removal(&mut state)?;
        Ok(Some(item.data))
    }

    /// Removes the single item with the given identity if it is still queued.
    /// Returns whether it was found. Order among survivors is preserved.
    /// # Errors
    /// In case of poisoned mutex or a failed readiness-pipe syscall.
    pub fn pop_match(&self, token: Token) -> Result<bool> {
        let mut state = unwrap_poison(self.state.lock())?;
        let Some(index) = state.items.iter().position(|item| item.token == token) else {
            return Ok(false);
        };
        if let Some(item) = state.items.remove(index) {
            state.bytes -= item.data.len();
        }
        self.after_removal(&mut state)?;
        Ok(true)
    }

    /// Readiness transitions shared by `pop` and `pop_match`, run after one
    /// item has left the queue.
    fn after_removal(&self, state: &mut State) -> Result<()> {
        if state.items.len() + 1 == self.max_items {
            self.write_ready.arm()?;
            state.writable = true;
            trace!("queue writable: re-armed below capacity");
        }
        if state.items.is_empty() {
            self.read_ready.disarm()?;
            state.readable = false;
            trace!("queue readable: disarmed on last item");
        }
        Ok(())
    }
}
