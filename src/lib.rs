//! Worker threads running isolated script interpreters, exchanging tagged
//! values over bounded channels whose readiness is visible to `select`/`poll`.

#![deny(clippy::correctness)]
#![warn(
    clippy::perf,
    clippy::complexity,
    clippy::style,
    clippy::nursery,
    clippy::pedantic,
    clippy::clone_on_ref_ptr,
    clippy::decimal_literal_representation,
    clippy::float_cmp_const,
    clippy::missing_docs_in_private_items,
    clippy::multiple_inherent_impl,
    clippy::unwrap_used,
    clippy::cargo_common_metadata,
    clippy::used_underscore_binding
)]

#[cfg(not(unix))]
compile_error!("this crate signals readiness through pipes and requires a unix target");

mod channel;
mod engine;
mod error;
mod pipe;
mod poller;
mod queue;
mod spawn;
mod thread;
mod value;

pub use channel::{Channel, PopResult, PushResult};
pub use engine::{EngineInstance, ScriptEngine, ScriptError, Source};
pub use error::{Error, Result};
pub use poller::{set_poller, EventId, Poller};
pub use queue::{PushOutcome, Queue, Token};
pub use spawn::{spawn_fn, spawn_from_file, spawn_from_source, spawn_with_engine};
pub use thread::{JoinResult, Status, Thread, WorkerContext, WorkerHandle, ERRMSG_MAX};
pub use value::{LightPtr, Value};

use std::sync::LockResult;

/// Poison error to crate error.
pub(crate) fn unwrap_poison<T>(result: LockResult<T>) -> Result<T> {
    result.map_err(|_| Error::Internal("poisoned mutex"))
}
