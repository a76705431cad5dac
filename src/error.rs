//! Crate error taxonomy.
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by queue, channel, thread and spawn operations.
///
/// Recoverable conditions (full/empty queues, timeouts, a busy thread
/// spawner) are not errors; they are reported through the outcome enums of
/// the operation that hit them. Everything in here is either caller misuse
/// or a genuine failure.
#[derive(Debug, Error)]
pub enum Error {
    /// A bad argument, such as an out-of-range timeout.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The channel handle was closed; the queue reference is gone.
    #[error("queue is closed")]
    Closed,
    /// An OS facility failed (pipe creation, fd exhaustion, poll failure).
    #[error("system resource failure")]
    Resource(#[from] io::Error),
    /// The OS refused to create a worker thread right now. Back off and retry.
    #[error("thread creation refused, try again")]
    Again,
    /// The source unit did not compile in the worker interpreter.
    #[error("invalid source unit: {0}")]
    InvalidSource(String),
    /// An internal invariant was violated. Not recoverable.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}
