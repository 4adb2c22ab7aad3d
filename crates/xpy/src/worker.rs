//! Worker-side dispatcher.
//!
//! Runs on a single thread inside a `LocalSet`. Three tasks cooperate:
//! - the reader loop (this future) decodes frames, settles nested-call replies
//!   directly and queues top-level commands;
//! - the command runner executes queued commands one at a time, in order;
//! - the forwarder writes every outbound frame to the controller.
//!
//! Because replies are settled by the reader loop, a command suspended in a
//! nested call still makes progress while the runner is busy.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    ActionKind, Command, CompleteOutcome, ContextValue, CorrelationId, ExecOutcome,
    FormatOutcome, FunctionCallRequest, FunctionReply, InstallOutcome, Reply, ToController,
    ToWorker,
};
use crate::callbacks::{CallbackTable, IdAllocator};
use crate::engine::{Binding, Engine};
use crate::interrupt::InterruptSignal;
use crate::registry::panic_message;

/// Capacity of the log-shipping channel; events beyond it are dropped.
const LOG_BUFFER: usize = 1024;

#[derive(Debug, Default)]
pub struct WorkerConfig {
    /// Shared interrupt flag, when the worker context has one.
    pub interrupt: Option<InterruptSignal>,
    /// `worker_log` frames produced by [`crate::worker_tracing_layer::WorkerTracingLayer`].
    pub logs: Option<mpsc::Receiver<ToController>>,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = Some(signal);
        self
    }

    pub fn with_log_receiver(mut self, logs: mpsc::Receiver<ToController>) -> Self {
        self.logs = Some(logs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteCallError {
    /// The controller function returned an error or panicked.
    #[error("{0}")]
    Failed(String),

    #[error("call to `{0}` was abandoned before the controller replied")]
    Abandoned(String),

    #[error("`{0}` was bound for an exec that has finished")]
    Expired(String),

    #[error("controller channel closed")]
    Disconnected,
}

/// Bookkeeping for calls the worker makes into the controller.
struct NestedCalls {
    ids: IdAllocator,
    pending: CallbackTable<FunctionReply>,
    outbox: mpsc::UnboundedSender<ToController>,
}

impl NestedCalls {
    fn new(outbox: mpsc::UnboundedSender<ToController>) -> Self {
        Self {
            ids: IdAllocator::new(),
            pending: CallbackTable::new(),
            outbox,
        }
    }
}

/// Nested ids issued while one exec runs.
struct CallScope {
    calls: Rc<NestedCalls>,
    issued: RefCell<Vec<CorrelationId>>,
    /// Set once the exec returns; proxies a program kept alive stop working.
    closed: Cell<bool>,
}

/// Proxy bound in place of a controller function.
#[derive(Clone)]
pub struct RemoteFunction {
    name: String,
    scope: Rc<CallScope>,
}

impl RemoteFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the controller to run the function and wait for its reply.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, RemoteCallError> {
        if self.scope.closed.get() {
            return Err(RemoteCallError::Expired(self.name.clone()));
        }
        let calls = &self.scope.calls;
        let id = calls.ids.next_id();
        let reply = calls
            .pending
            .register(id, ActionKind::FunctionCall)
            .map_err(|e| RemoteCallError::Failed(e.to_string()))?;
        self.scope.issued.borrow_mut().push(id);

        tracing::debug!(id, name = %self.name, "Calling controller function");
        let frame = ToController::FunctionCall {
            id,
            data: FunctionCallRequest {
                name: self.name.clone(),
                args,
            },
        };
        if calls.outbox.send(frame).is_err() {
            calls.pending.discard(id);
            return Err(RemoteCallError::Disconnected);
        }

        match reply.await {
            Ok(reply) => reply.into_result().map_err(RemoteCallError::Failed),
            Err(_) => Err(RemoteCallError::Abandoned(self.name.clone())),
        }
    }
}

/// Names bound for one exec. Dropping it unbinds them and discards nested
/// calls that never got a reply, on every exit path including cancellation.
struct ExecScope<'a> {
    engine: &'a dyn Engine,
    bound: Vec<String>,
    calls: Rc<CallScope>,
}

impl<'a> ExecScope<'a> {
    fn bind(
        engine: &'a dyn Engine,
        calls: &Rc<NestedCalls>,
        context: BTreeMap<String, ContextValue>,
    ) -> Self {
        let scope = Rc::new(CallScope {
            calls: Rc::clone(calls),
            issued: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        });
        let mut bound = Vec::with_capacity(context.len());
        for (name, value) in context {
            let binding = match value {
                ContextValue::Function(reference) => Binding::Function(RemoteFunction {
                    name: reference.name,
                    scope: Rc::clone(&scope),
                }),
                ContextValue::Value(value) => Binding::Value(value),
            };
            engine.bind(&name, binding);
            bound.push(name);
        }
        Self {
            engine,
            bound,
            calls: scope,
        }
    }
}

impl Drop for ExecScope<'_> {
    fn drop(&mut self) {
        self.calls.closed.set(true);
        for name in &self.bound {
            self.engine.unbind(name);
        }
        let discarded = self
            .calls
            .issued
            .borrow_mut()
            .drain(..)
            .filter(|id| self.calls.calls.pending.discard(*id))
            .count();
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded unanswered nested calls");
        }
    }
}

/// Run the worker over a byte stream pair until the controller hangs up or
/// asks it to shut down.
pub async fn run_worker<R, W>(
    engine: Rc<dyn Engine>,
    reader: R,
    writer: W,
    config: WorkerConfig,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    LocalSet::new()
        .run_until(serve(engine, reader, writer, config))
        .await
}

/// Serve a child-process worker on stdin/stdout, shipping its logs to the controller.
pub async fn serve_stdio<E: Engine>(engine: E) -> io::Result<()> {
    let (log_tx, log_rx) = mpsc::channel(LOG_BUFFER);
    crate::logging::init_worker_tracing(log_tx);
    tracing::info!("Worker process starting");

    let config = WorkerConfig::new().with_log_receiver(log_rx);
    run_worker(
        Rc::new(engine),
        tokio::io::stdin(),
        tokio::io::stdout(),
        config,
    )
    .await
}

async fn serve<R, W>(
    engine: Rc<dyn Engine>,
    reader: R,
    writer: W,
    config: WorkerConfig,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let mut frames = FramedRead::new(reader, JsonCodec::<ToWorker>::new());
    let (outbox, outbox_rx) = mpsc::unbounded_channel::<ToController>();
    let shutdown = CancellationToken::new();
    let forwarder = tokio::task::spawn_local(forward_frames(
        FramedWrite::new(writer, JsonCodec::new()),
        outbox_rx,
        shutdown.clone(),
    ));

    let log_task = config.logs.map(|mut logs| {
        let outbox = outbox.clone();
        tokio::task::spawn_local(async move {
            while let Some(frame) = logs.recv().await {
                if outbox.send(frame).is_err() {
                    break;
                }
            }
        })
    });

    tracing::info!("Worker starting bootstrap");
    if let Err(e) = engine.bootstrap().await {
        let error = engine.describe_error(&e);
        tracing::error!(%error, "Bootstrap failed");
        let _ = outbox.send(ToController::SetupFailed { error });
        drop(outbox);
        if let Some(task) = log_task {
            task.abort();
        }
        shutdown.cancel();
        let _ = forwarder.await;
        return Ok(());
    }

    let interrupt = config
        .interrupt
        .clone()
        .filter(|signal| engine.register_interrupt(signal.clone()));
    tracing::debug!(interrupt = interrupt.is_some(), "Sending ready");
    let _ = outbox.send(ToController::Ready {
        interrupt: interrupt.is_some(),
    });

    let calls = Rc::new(NestedCalls::new(outbox.clone()));
    let (command_tx, command_rx) = mpsc::unbounded_channel::<(CorrelationId, Command)>();
    let mut runner = tokio::task::spawn_local(run_commands(
        Rc::clone(&engine),
        Rc::clone(&calls),
        config.interrupt,
        command_rx,
        outbox.clone(),
    ));
    let mut runner_done = false;

    let mut result = Ok(());
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            joined = &mut runner, if !runner_done => {
                runner_done = true;
                tracing::error!(error = ?joined.err(), "Command runner stopped");
                break;
            }
        };
        match frame {
            Some(Ok(ToWorker::FunctionCall { id, data })) => {
                if let Err(e) = calls.pending.settle(id, ActionKind::FunctionCall, data) {
                    // Replies to calls discarded by an aborted exec land here too.
                    tracing::warn!(error = %e, "Dropping nested-call reply");
                }
            }
            Some(Ok(ToWorker::Shutdown)) => {
                tracing::info!("Shutdown requested");
                break;
            }
            Some(Ok(frame)) => match frame.into_command() {
                Ok((id, command)) => {
                    tracing::trace!(id, action = %command.action(), "Command queued");
                    if command_tx.send((id, command)).is_err() {
                        tracing::error!("Command runner stopped");
                        break;
                    }
                }
                Err(other) => tracing::warn!(?other, "Unexpected frame"),
            },
            Some(Err(e)) => {
                tracing::error!(error = %e, "Controller channel error");
                result = Err(e);
                break;
            }
            None => {
                tracing::debug!("Controller channel closed");
                break;
            }
        }
    }

    drop(command_tx);
    if !runner_done {
        runner.abort();
        let _ = runner.await;
    }
    if let Some(task) = log_task {
        task.abort();
    }
    shutdown.cancel();
    let _ = forwarder.await;

    tracing::info!("Worker exiting");
    result
}

async fn run_commands(
    engine: Rc<dyn Engine>,
    calls: Rc<NestedCalls>,
    interrupt: Option<InterruptSignal>,
    mut commands: mpsc::UnboundedReceiver<(CorrelationId, Command)>,
    outbox: mpsc::UnboundedSender<ToController>,
) {
    while let Some((id, command)) = commands.recv().await {
        if let Some(signal) = &interrupt {
            signal.clear();
        }
        let action = command.action();
        tracing::debug!(id, %action, "Running command");
        let reply = match AssertUnwindSafe(handle_command(engine.as_ref(), &calls, command))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(panic) => {
                let error = format!("engine panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(id, %action, %error, "Command panicked");
                failed_reply(action, error)
            }
        };
        tracing::debug!(id, %action, "Command finished");
        if outbox.send(ToController::reply(id, reply)).is_err() {
            break;
        }
    }
}

/// The failure shape of `action`'s response.
fn failed_reply(action: ActionKind, error: String) -> Reply {
    match action {
        ActionKind::Complete => Reply::Complete(CompleteOutcome {
            result: None,
            error: Some(error),
        }),
        ActionKind::Install => Reply::Install(InstallOutcome {
            success: false,
            error: Some(error),
        }),
        ActionKind::Format => Reply::Format(FormatOutcome {
            result: None,
            error: Some(error),
        }),
        ActionKind::Exec | ActionKind::FunctionCall => Reply::Exec(ExecOutcome::failed(error)),
    }
}

async fn handle_command(engine: &dyn Engine, calls: &Rc<NestedCalls>, command: Command) -> Reply {
    match command {
        Command::Exec(payload) => {
            let scope = ExecScope::bind(engine, calls, payload.context);
            let result = engine.run(&payload.code).await;
            drop(scope);
            Reply::Exec(match result {
                Ok(output) => ExecOutcome::success(output.result, output.stdout, output.stderr),
                Err(e) => ExecOutcome::failed(engine.describe_error(&e)),
            })
        }
        Command::Complete(payload) => {
            let (line, column) = payload.cursor();
            Reply::Complete(match engine.complete(&payload.code, line, column).await {
                Ok(completions) => CompleteOutcome {
                    result: Some(completions),
                    error: None,
                },
                Err(e) => CompleteOutcome {
                    result: None,
                    error: Some(engine.describe_error(&e)),
                },
            })
        }
        Command::Install(payload) => {
            let mut outcome = InstallOutcome {
                success: true,
                error: None,
            };
            for package in &payload.packages {
                if let Err(e) = engine.install(package).await {
                    tracing::debug!(%package, error = %e, "Install failed");
                    outcome = InstallOutcome {
                        success: false,
                        error: Some(engine.describe_error(&e)),
                    };
                    break;
                }
            }
            Reply::Install(outcome)
        }
        Command::Format(payload) => {
            Reply::Format(match engine.format(&payload.code, &payload.options).await {
                Ok(code) => FormatOutcome {
                    result: Some(code),
                    error: None,
                },
                Err(e) => FormatOutcome {
                    result: None,
                    error: Some(engine.describe_error(&e)),
                },
            })
        }
    }
}

async fn forward_frames<W: AsyncWrite + Unpin>(
    mut writer: FramedWrite<W, JsonCodec<ToController>>,
    mut frames: mpsc::UnboundedReceiver<ToController>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        if let Err(e) = writer.send(frame).await {
            tracing::warn!(error = %e, "Failed to write frame");
            break;
        }
    }
    tracing::trace!("Frame forwarder exiting");
}
