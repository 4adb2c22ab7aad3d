//! Controller side of the bridge.
//!
//! [`Bridge`] brings the worker up lazily and exactly once, then hands commands
//! to the [`Dispatcher`], which owns the id allocator, the pending table and
//! the function registry. A single event loop task owns both halves of the
//! transport: it writes queued frames and routes every inbound frame.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    ActionKind, Command, CompleteOutcome, CompletePayload, Completions, CorrelationId,
    ExecOutcome, ExecPayload, FormatOutcome, FormatPayload, FunctionCallRequest, FunctionReply,
    InstallOutcome, InstallPayload, Reply, ToController, ToWorker,
};
use crate::bridge::transport::{BoxedReader, BoxedWriter, WorkerHandle, WorkerLink, WorkerSpawner};
use crate::callbacks::{CallbackTable, IdAllocator};
use crate::error::{BridgeError, ProtocolError, SetupError};
use crate::interrupt::InterruptSignal;
use crate::registry::{self, Context, FunctionRegistry, HostFunction, MarshalledContext};

const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(300);

pub const SETUP_TIMEOUT_ENV: &str = "XPY_SETUP_TIMEOUT_SECS";

#[derive(Clone)]
pub struct BridgeConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub setup_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(spawner: impl WorkerSpawner + 'static) -> Self {
        Self {
            spawner: Arc::new(spawner),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    /// Like [`BridgeConfig::new`], with the setup timeout read from `XPY_SETUP_TIMEOUT_SECS`.
    pub fn from_env(spawner: impl WorkerSpawner + 'static) -> Self {
        let config = Self::new(spawner);
        let Ok(raw) = std::env::var(SETUP_TIMEOUT_ENV) else {
            return config;
        };
        match parse_setup_timeout(&raw) {
            Some(timeout) => config.with_setup_timeout(timeout),
            None => {
                tracing::warn!(value = %raw, "Ignoring invalid {}", SETUP_TIMEOUT_ENV);
                config
            }
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

fn parse_setup_timeout(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Source text plus the names to bind while it runs.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub code: String,
    pub context: Context,
}

impl ExecRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            context: Context::new(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

impl From<&str> for ExecRequest {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for ExecRequest {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub ready: bool,
    pub pending: usize,
    pub functions: usize,
}

type ReadyFuture = Shared<BoxFuture<'static, Result<Arc<Link>, SetupError>>>;

/// A worker that signalled readiness.
struct Link {
    dispatcher: Arc<Dispatcher>,
    /// Set only when the spawner shares memory and the engine accepted the flag.
    interrupt: Option<InterruptSignal>,
    event_loop: tokio::task::JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// Handle to one worker. Clones share the worker.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    attempt: Mutex<Option<ReadyFuture>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                config,
                attempt: Mutex::new(None),
            }),
        }
    }

    /// Bring the worker up if nobody has yet. Concurrent callers share one
    /// attempt, and a failed attempt is final.
    pub async fn ensure_ready(&self) -> Result<(), BridgeError> {
        self.link().await.map(|_| ())
    }

    pub async fn exec(&self, request: impl Into<ExecRequest>) -> Result<ExecOutcome, BridgeError> {
        let ExecRequest { code, context } = request.into();
        let MarshalledContext { wire, functions } = context.marshal();
        let command = Command::Exec(ExecPayload {
            code,
            context: wire,
        });
        match self.submit(command, functions).await? {
            Reply::Exec(outcome) => Ok(outcome),
            other => Err(wrong_reply(ActionKind::Exec, &other)),
        }
    }

    /// Completions at the cursor. An omitted line means the last line, an
    /// omitted column the end of that line.
    pub async fn complete(
        &self,
        code: impl Into<String>,
        line: Option<u32>,
        column: Option<u32>,
    ) -> Result<Completions, BridgeError> {
        let payload = CompletePayload {
            code: code.into(),
            line,
            column,
        }
        .normalized();
        match self.submit(Command::Complete(payload), Vec::new()).await? {
            Reply::Complete(CompleteOutcome {
                error: Some(error), ..
            }) => Err(BridgeError::Execution(error)),
            Reply::Complete(CompleteOutcome { result, .. }) => Ok(result.unwrap_or_default()),
            other => Err(wrong_reply(ActionKind::Complete, &other)),
        }
    }

    pub async fn install<I, S>(&self, packages: I) -> Result<InstallOutcome, BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let payload = InstallPayload {
            packages: packages.into_iter().map(Into::into).collect(),
        };
        match self.submit(Command::Install(payload), Vec::new()).await? {
            Reply::Install(InstallOutcome {
                error: Some(error), ..
            }) => Err(BridgeError::Execution(error)),
            Reply::Install(outcome) => Ok(outcome),
            other => Err(wrong_reply(ActionKind::Install, &other)),
        }
    }

    pub async fn format(
        &self,
        code: impl Into<String>,
        options: Map<String, Value>,
    ) -> Result<String, BridgeError> {
        let payload = FormatPayload {
            code: code.into(),
            options,
        };
        match self.submit(Command::Format(payload), Vec::new()).await? {
            Reply::Format(FormatOutcome {
                error: Some(error), ..
            }) => Err(BridgeError::Execution(error)),
            Reply::Format(FormatOutcome { result, .. }) => Ok(result.unwrap_or_default()),
            other => Err(wrong_reply(ActionKind::Format, &other)),
        }
    }

    /// Ask the running program to stop at its next polling point. Does not wait.
    pub fn interrupt(&self) -> Result<(), BridgeError> {
        if !self.inner.config.spawner.shares_memory() {
            return Err(BridgeError::InterruptUnsupported);
        }
        let Some(ready) = self.peek() else {
            tracing::debug!("Interrupt requested before the worker is ready");
            return Ok(());
        };
        let link = ready?;
        match &link.interrupt {
            Some(signal) => {
                tracing::debug!("Requesting interrupt");
                signal.request();
                Ok(())
            }
            None => Err(BridgeError::InterruptUnsupported),
        }
    }

    /// Stop the worker and wait until its channel closes. Pending operations
    /// fail with [`BridgeError::Disconnected`].
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let Some(attempt) = self.current_attempt() else {
            return Ok(());
        };
        let Ok(link) = attempt.await else {
            return Ok(());
        };
        tracing::info!("Shutting down worker");
        if link.dispatcher.outbox.send(ToWorker::Shutdown).is_ok() {
            link.dispatcher.closed.cancelled().await;
        }
        Ok(())
    }

    pub fn stats(&self) -> BridgeStats {
        match self.peek() {
            Some(Ok(link)) => BridgeStats {
                ready: true,
                pending: link.dispatcher.pending.len(),
                functions: link.dispatcher.registry.len(),
            },
            _ => BridgeStats::default(),
        }
    }

    async fn submit(
        &self,
        command: Command,
        functions: Vec<(String, Arc<dyn HostFunction>)>,
    ) -> Result<Reply, BridgeError> {
        let link = self.link().await?;
        link.dispatcher.submit(command, functions).await
    }

    async fn link(&self) -> Result<Arc<Link>, BridgeError> {
        let attempt = {
            let mut slot = self
                .inner
                .attempt
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| {
                let setup = tokio::spawn(bring_up(self.inner.config.clone()));
                async move {
                    setup.await.unwrap_or_else(|e| {
                        Err(SetupError::Spawn(format!("setup task failed: {e}")))
                    })
                }
                .boxed()
                .shared()
            })
            .clone()
        };
        Ok(attempt.await?)
    }

    fn current_attempt(&self) -> Option<ReadyFuture> {
        self.inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Outcome of the bring-up, if it has finished.
    fn peek(&self) -> Option<Result<Arc<Link>, BridgeError>> {
        let attempt = self.current_attempt()?;
        attempt
            .peek()
            .map(|ready| ready.clone().map_err(BridgeError::from))
    }
}

fn wrong_reply(expected: ActionKind, reply: &Reply) -> BridgeError {
    BridgeError::Execution(format!(
        "expected {expected} response, got {}",
        reply.action()
    ))
}

async fn bring_up(config: BridgeConfig) -> Result<Arc<Link>, SetupError> {
    tracing::info!("Spawning worker");
    let WorkerLink {
        reader,
        writer,
        interrupt,
        handle,
    } = config
        .spawner
        .spawn()
        .map_err(|e| SetupError::Spawn(e.to_string()))?;

    let mut frames = FramedRead::new(reader, JsonCodec::<ToController>::new());

    tracing::debug!("Waiting for ready from worker");
    let accepted = tokio::time::timeout(config.setup_timeout, wait_for_ready(&mut frames))
        .await
        .map_err(|_| SetupError::Timeout(config.setup_timeout))??;

    let interrupt = interrupt.filter(|_| accepted);
    tracing::info!(interrupt = interrupt.is_some(), "Worker ready");

    let (dispatcher, outbound) = Dispatcher::new();
    let dispatcher = Arc::new(dispatcher);
    let event_loop = tokio::spawn(run_event_loop(
        Arc::clone(&dispatcher),
        frames,
        FramedWrite::new(writer, JsonCodec::new()),
        outbound,
        handle,
    ));

    Ok(Arc::new(Link {
        dispatcher,
        interrupt,
        event_loop,
    }))
}

/// Consume frames up to the readiness signal. Returns whether the worker polls
/// the interrupt flag.
async fn wait_for_ready(
    frames: &mut FramedRead<BoxedReader, JsonCodec<ToController>>,
) -> Result<bool, SetupError> {
    loop {
        match frames.next().await {
            Some(Ok(ToController::Ready { interrupt })) => return Ok(interrupt),
            Some(Ok(ToController::SetupFailed { error })) => return Err(SetupError::Worker(error)),
            Some(Ok(ToController::WorkerLog {
                target,
                level,
                message,
            })) => emit_worker_log(&target, &level, &message),
            Some(Ok(other)) => return Err(SetupError::UnexpectedMessage(other.kind().to_string())),
            Some(Err(e)) => return Err(SetupError::Transport(e.to_string())),
            None => return Err(SetupError::WorkerExited),
        }
    }
}

async fn run_event_loop(
    dispatcher: Arc<Dispatcher>,
    mut frames: FramedRead<BoxedReader, JsonCodec<ToController>>,
    mut sink: FramedWrite<BoxedWriter, JsonCodec<ToWorker>>,
    mut outbound: mpsc::UnboundedReceiver<ToWorker>,
    handle: Option<WorkerHandle>,
) {
    let reason = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = dispatcher.on_message(frame) {
                        tracing::error!(error = %e, "Protocol error");
                        if e.is_fatal() {
                            break BridgeError::Protocol(e);
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Worker channel error");
                    break BridgeError::Disconnected;
                }
                None => {
                    tracing::info!("Worker channel closed");
                    break BridgeError::Disconnected;
                }
            },

            Some(frame) = outbound.recv() => {
                if let Err(e) = sink.send(frame).await {
                    tracing::error!(error = %e, "Failed to send frame to worker");
                    break BridgeError::Disconnected;
                }
            }
        }
    };

    let failed = dispatcher.close(reason);
    if failed > 0 {
        tracing::warn!(failed, "Failed pending operations after channel loss");
    }
    drop(handle);
}

/// Routes commands out and responses back in.
struct Dispatcher {
    outbox: mpsc::UnboundedSender<ToWorker>,
    ids: IdAllocator,
    pending: CallbackTable<Result<Reply, BridgeError>>,
    registry: FunctionRegistry,
    /// First fatal error; once set, nothing new is submitted.
    failure: Mutex<Option<BridgeError>>,
    closed: CancellationToken,
}

impl Dispatcher {
    fn new() -> (Self, mpsc::UnboundedReceiver<ToWorker>) {
        let (outbox, outbound) = mpsc::unbounded_channel();
        let dispatcher = Self {
            outbox,
            ids: IdAllocator::new(),
            pending: CallbackTable::new(),
            registry: FunctionRegistry::new(),
            failure: Mutex::new(None),
            closed: CancellationToken::new(),
        };
        (dispatcher, outbound)
    }

    fn failure(&self) -> Option<BridgeError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn submit(
        &self,
        command: Command,
        functions: Vec<(String, Arc<dyn HostFunction>)>,
    ) -> Result<Reply, BridgeError> {
        if let Some(error) = self.failure() {
            return Err(error);
        }

        let id = self.ids.next_id();
        let action = command.action();
        self.registry.register_scope(id, functions)?;
        let reply = match self.pending.register(id, action) {
            Ok(reply) => reply,
            Err(e) => {
                self.registry.release_scope(id);
                return Err(e.into());
            }
        };
        // close() may have drained the table between the first check and registration.
        if let Some(error) = self.failure() {
            self.abandon(id);
            return Err(error);
        }

        tracing::debug!(id, %action, "Submitting command");
        if self.outbox.send(ToWorker::command(id, command)).is_err() {
            self.abandon(id);
            return Err(BridgeError::Disconnected);
        }

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(self.failure().unwrap_or(BridgeError::Disconnected)),
        }
    }

    fn abandon(&self, id: CorrelationId) {
        self.pending.discard(id);
        self.registry.release_scope(id);
    }

    fn on_message(&self, frame: ToController) -> Result<(), ProtocolError> {
        let frame = match frame.into_reply() {
            Ok((id, reply)) => {
                let action = reply.action();
                tracing::debug!(id, %action, "Response received");
                // Functions go before the caller resumes, and only for the
                // exec this reply actually settles.
                if action == ActionKind::Exec && self.pending.expects(id, action) {
                    self.registry.release_scope(id);
                }
                return self.pending.settle(id, action, Ok(reply));
            }
            Err(frame) => frame,
        };

        match frame {
            ToController::FunctionCall { id, data } => self.invoke_function(id, data),
            ToController::WorkerLog {
                target,
                level,
                message,
            } => {
                emit_worker_log(&target, &level, &message);
                Ok(())
            }
            other => {
                tracing::warn!(kind = other.kind(), "Unexpected message after readiness");
                Ok(())
            }
        }
    }

    fn invoke_function(
        &self,
        id: CorrelationId,
        request: FunctionCallRequest,
    ) -> Result<(), ProtocolError> {
        let Some(function) = self.registry.lookup(&request.name) else {
            let error = ProtocolError::UnknownFunction { name: request.name };
            let _ = self.outbox.send(ToWorker::FunctionCall {
                id,
                data: FunctionReply::failed(error.to_string()),
            });
            return Err(error);
        };

        tracing::debug!(id, name = %request.name, "Invoking host function");
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let reply = registry::invoke(function, request.args).await;
            if outbox.send(ToWorker::FunctionCall { id, data: reply }).is_err() {
                tracing::debug!(id, "Worker gone before the function reply was sent");
            }
        });
        Ok(())
    }

    /// Fail everything pending and refuse new work. Returns how many operations failed.
    fn close(&self, error: BridgeError) -> usize {
        let error = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(error)
            .clone();
        let failed = self.pending.fail_all(|| Err(error.clone()));
        self.registry.clear();
        self.closed.cancel();
        failed
    }
}

/// Re-emit a shipped worker event under `xpy::worker`, keeping its level.
fn emit_worker_log(target: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "xpy::worker", worker_target = target, "{}", message),
        "warn" => tracing::warn!(target: "xpy::worker", worker_target = target, "{}", message),
        "debug" => tracing::debug!(target: "xpy::worker", worker_target = target, "{}", message),
        "trace" => tracing::trace!(target: "xpy::worker", worker_target = target, "{}", message),
        _ => tracing::info!(target: "xpy::worker", worker_target = target, "{}", message),
    }
}
