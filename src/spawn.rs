//! Spawn plumbing: duplicate channel references, wire the lifecycle pipes,
//! start the worker thread and guarantee its termination announcement.
use crate::channel::Channel;
use crate::engine::{EngineInstance, FnInstance, ScriptEngine, ScriptError, Source};
use crate::error::{Error, Result};
use crate::pipe;
use crate::pipe::Pipe;
use crate::thread::{Shared, Status, Thread, WorkerContext, WorkerHandle};
use defer_heavy::defer;
use log::{debug, warn};
use std::cell::RefCell;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Monotonic worker name suffix.
static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Spawns a worker executing the given program text.
/// # Errors
/// [`Error::InvalidSource`] if the text does not compile,
/// [`Error::Again`] if the OS cannot take another thread right now.
pub fn spawn_from_source(
    engine: &dyn ScriptEngine,
    text: impl Into<String>,
    channels: &[Channel],
) -> Result<Thread> {
    spawn_with_engine(engine, &Source::from_text(text), channels)
}

/// Spawns a worker executing the program in the given file.
/// # Errors
/// As [`spawn_from_source`], plus [`Error::Resource`] if the file cannot
/// be read.
pub fn spawn_from_file(
    engine: &dyn ScriptEngine,
    path: &Path,
    channels: &[Channel],
) -> Result<Thread> {
    let source = Source::from_file(path).map_err(Error::Resource)?;
    spawn_with_engine(engine, &source, channels)
}

/// Spawns a worker from an already-built source unit.
///
/// The engine instantiates and compiles on the calling thread, so a broken
/// source unit fails here, before any OS thread exists.
/// # Errors
/// [`Error::InvalidSource`] if the engine rejects the source,
/// [`Error::Again`] if the OS cannot take another thread right now.
pub fn spawn_with_engine(
    engine: &dyn ScriptEngine,
    source: &Source,
    channels: &[Channel],
) -> Result<Thread> {
    let mut instance = engine
        .instantiate()
        .map_err(|err| Error::InvalidSource(err.to_string()))?;
    instance
        .load(source)
        .map_err(|err| Error::InvalidSource(err.to_string()))?;
    launch(instance, channels)
}

/// Spawns a worker whose body is native code instead of script text.
/// # Errors
/// [`Error::Again`] if the OS cannot take another thread right now, or a
/// propagated channel/pipe failure.
pub fn spawn_fn<F>(body: F, channels: &[Channel]) -> Result<Thread>
where
    F: FnOnce(&mut WorkerContext) -> std::result::Result<(), ScriptError> + Send + 'static,
{
    launch(FnInstance::new(body), channels)
}

/// The common tail of every spawn: reference duplication, pipes, thread.
fn launch(instance: Box<dyn EngineInstance>, channels: &[Channel]) -> Result<Thread> {
    // Each clone is one queue reference owned by the worker interpreter.
    let worker_channels = channels
        .iter()
        .map(Channel::try_clone)
        .collect::<Result<Vec<_>>>()?;
    let (term_read, term_write) = Pipe::new()?.into_ends();
    let (cancel_read, cancel_write) = Pipe::new()?.into_ends();
    let shared = Shared::new();
    let ctx = WorkerContext::new(
        WorkerHandle::new(cancel_read, Arc::clone(&shared)),
        worker_channels,
    );
    let worker_shared = Arc::clone(&shared);
    let name = format!(
        "threadpipe-worker-{}",
        WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_main(instance, ctx, &worker_shared, &term_write))
        .map_err(|err| {
            if err.kind() == ErrorKind::WouldBlock {
                Error::Again
            } else {
                Error::Resource(err)
            }
        })?;
    debug!("worker spawned");
    Ok(Thread::assemble(handle, term_read, cancel_write, shared))
}

/// The worker entry point.
///
/// The cleanup block runs on every exit path: normal return, script error,
/// cooperative interrupt and panic. It records the terminal status and
/// writes the termination byte while the interpreter instance still exists;
/// the instance is torn down only afterwards, when the parameters drop.
fn worker_main(
    mut instance: Box<dyn EngineInstance>,
    mut ctx: WorkerContext,
    shared: &Arc<Shared>,
    term_write: &OwnedFd,
) {
    // `None` is the "still executing" sentinel: if the cleanup finds it, the
    // protected invocation never completed.
    let outcome: RefCell<Option<std::result::Result<(), ScriptError>>> = RefCell::new(None);
    defer! {
        // This also happens on panic!
        let status = match outcome.borrow_mut().take() {
            None | Some(Err(ScriptError::Interrupted)) => Status::Cancelled,
            Some(Ok(())) => Status::Terminated,
            Some(Err(ScriptError::Failed(msg))) => Status::failed(msg),
        };
        debug!("worker finished: {}", status.label());
        shared.set_status(status);
        match pipe::write_one(term_write.as_raw_fd(), pipe::SIGNAL_BYTE) {
            Ok(true) => {}
            Ok(false) => warn!("termination pipe unexpectedly full"),
            Err(err) => warn!("termination byte write failed: {err}"),
        }
    }
    *outcome.borrow_mut() = Some(instance.run(&mut ctx));
}
