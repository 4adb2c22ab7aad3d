//! Worker contexts and the byte streams that connect them to the controller.
//!
//! - **InProcessSpawner**: dedicated OS thread with its own current-thread runtime,
//!   connected through an in-memory duplex pipe. Shares the interrupt byte.
//! - **ProcessSpawner**: child process speaking frames over stdin/stdout. No shared
//!   memory, so interrupts are unavailable.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::engine::Engine;
use crate::interrupt::InterruptSignal;
use crate::worker::{WorkerConfig, run_worker};

/// In-memory pipe capacity per direction.
const PIPE_BUFFER_BYTES: usize = 64 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Keeps the worker context alive for as long as the controller holds the link.
#[derive(Debug)]
pub enum WorkerHandle {
    /// Detached on drop; the thread exits once its end of the pipe closes.
    Thread(std::thread::JoinHandle<()>),
    /// Killed on drop.
    Process(Child),
}

/// A freshly spawned worker as seen from the controller.
pub struct WorkerLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Present only when the worker context shares memory with the controller.
    pub interrupt: Option<InterruptSignal>,
    pub handle: Option<WorkerHandle>,
}

impl WorkerLink {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            interrupt: None,
            handle: None,
        }
    }

    pub fn with_interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = Some(signal);
        self
    }

    pub fn with_handle(mut self, handle: WorkerHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

/// Extension point for different worker contexts.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerLink, SpawnError>;

    /// Whether spawned workers can share the interrupt byte with the controller.
    fn shares_memory(&self) -> bool;
}

type EngineFactory = Arc<dyn Fn() -> Rc<dyn Engine> + Send + Sync>;

/// Runs the worker on a dedicated thread of this process.
#[derive(Clone)]
pub struct InProcessSpawner {
    factory: EngineFactory,
    thread_name: String,
}

impl InProcessSpawner {
    /// `factory` runs on the worker thread, so the engine itself need not be `Send`.
    pub fn new<F, E>(factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Engine,
    {
        Self {
            factory: Arc::new(move || Rc::new(factory()) as Rc<dyn Engine>),
            thread_name: "xpy-worker".to_string(),
        }
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self) -> Result<WorkerLink, SpawnError> {
        let (controller_io, worker_io) = tokio::io::duplex(PIPE_BUFFER_BYTES);
        let interrupt = InterruptSignal::new();
        let config = WorkerConfig::new().with_interrupt(interrupt.clone());
        let factory = Arc::clone(&self.factory);

        tracing::debug!(thread = %self.thread_name, "Spawning worker thread");
        let handle = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                let (reader, writer) = tokio::io::split(worker_io);
                if let Err(e) = runtime.block_on(run_worker(factory(), reader, writer, config)) {
                    tracing::warn!(error = %e, "Worker thread exited with error");
                }
            })?;

        let (reader, writer) = tokio::io::split(controller_io);
        Ok(WorkerLink::new(reader, writer)
            .with_interrupt(interrupt)
            .with_handle(WorkerHandle::Thread(handle)))
    }

    fn shares_memory(&self) -> bool {
        true
    }
}

/// Runs the worker as a child process; frames travel over its stdin/stdout,
/// its stderr is inherited.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<WorkerLink, SpawnError> {
        tracing::debug!(program = %self.program.display(), "Spawning worker process");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        Ok(WorkerLink::new(stdout, stdin).with_handle(WorkerHandle::Process(child)))
    }

    fn shares_memory(&self) -> bool {
        false
    }
}
