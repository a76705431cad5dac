//! The interpreter seam: the runtime starts and observes workers, the host
//! brings the script engine.
//!
//! One [`EngineInstance`] runs per worker thread and never leaves it, which
//! is what keeps interpreters isolated. The runtime talks to an instance
//! exactly three times: `load` on the spawning thread, `run` inside the
//! worker, and implicitly on drop after the termination byte went out.
use crate::thread::WorkerContext;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// A source unit to execute in a worker.
#[derive(Debug, Clone)]
pub struct Source {
    /// Name used in engine error messages and tracebacks.
    name: String,
    /// The program text.
    text: String,
}

impl Source {
    /// A source unit from a string.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            name: "=(load)".to_owned(),
            text: text.into(),
        }
    }

    /// A source unit read from a file; the path becomes the chunk name.
    /// # Errors
    /// Propagated from reading the file.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self {
            name: path.display().to_string(),
            text: fs::read_to_string(path)?,
        })
    }

    /// The chunk name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The program text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// How a protected invocation ended, when it did not return normally.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script raised; the message is surfaced through `Thread::status`.
    #[error("{0}")]
    Failed(String),
    /// The engine observed a hard-cancel request at one of its cancellation
    /// points and unwound cooperatively.
    #[error("worker interrupted")]
    Interrupted,
}

/// Factory for isolated interpreter instances.
pub trait ScriptEngine: Send + Sync {
    /// Creates a fresh instance: a new interpreter state with standard
    /// libraries opened and a traceback hook installed.
    /// # Errors
    /// Engine-defined instantiation failures.
    fn instantiate(&self) -> Result<Box<dyn EngineInstance>, ScriptError>;
}

/// One worker's interpreter.
///
/// Implementations should poll [`WorkerContext::hard_cancelled`] at their
/// cancellation points (instruction-count hooks, blocking waits) and return
/// [`ScriptError::Interrupted`] when it fires; that is what makes a worker
/// hard-cancellable.
pub trait EngineInstance: Send {
    /// Compiles a source unit into the instance.
    /// A failure here aborts the spawn before any thread is created.
    /// # Errors
    /// The engine's compile error, message included.
    fn load(&mut self, source: &Source) -> Result<(), ScriptError>;

    /// The protected invocation of the worker body. The context is the
    /// worker's argument list: its self handle first, then the channels.
    /// # Errors
    /// [`ScriptError::Failed`] when the script raises,
    /// [`ScriptError::Interrupted`] when a hard cancel was observed.
    fn run(&mut self, ctx: &mut WorkerContext) -> Result<(), ScriptError>;
}

/// The closure-backed instance behind `spawn_fn`: for hosts whose "source"
/// is native code rather than script text.
pub(crate) struct FnInstance {
    /// The body; taken on the single `run`.
    body: Option<Box<dyn FnOnce(&mut WorkerContext) -> Result<(), ScriptError> + Send>>,
}

impl FnInstance {
    /// Wraps a worker body closure.
    pub(crate) fn new(
        body: impl FnOnce(&mut WorkerContext) -> Result<(), ScriptError> + Send + 'static,
    ) -> Box<dyn EngineInstance> {
        Box::new(Self {
            body: Some(Box::new(body)),
        })
    }
}

impl EngineInstance for FnInstance {
    fn load(&mut self, _source: &Source) -> Result<(), ScriptError> {
        Ok(())
    }

    fn run(&mut self, ctx: &mut WorkerContext) -> Result<(), ScriptError> {
        match self.body.take() {
            Some(body) => body(ctx),
            None => Err(ScriptError::Failed("worker body already consumed".to_owned())),
        }
    }
}
