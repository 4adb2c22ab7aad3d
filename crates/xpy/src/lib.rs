//! xpy: command/response bridge between a controller and an isolated worker
//! running an embedded interpreter.
//!
//! The controller ([`Bridge`]) issues exec, complete, install and format
//! commands and awaits typed results. While a program runs, it may call
//! functions the controller passed in its context; those calls travel back over
//! the same channel as function references. A shared one-byte flag lets the
//! controller interrupt a running program cooperatively.

pub mod bridge;
pub mod callbacks;
pub mod controller;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod logging;
pub mod registry;
pub mod worker;
pub mod worker_tracing_layer;

pub use bridge::protocol::{
    CompletionMatch, Completions, ExecOutcome, FunctionRef, InstallOutcome,
};
pub use bridge::transport::{InProcessSpawner, ProcessSpawner, WorkerSpawner};
pub use controller::{Bridge, BridgeConfig, BridgeStats, ExecRequest};
pub use engine::{Binding, Engine, EngineError, RunOutput};
pub use error::{BridgeError, ProtocolError, SetupError};
pub use interrupt::InterruptSignal;
pub use registry::{Context, HostFunction, host_fn, host_fn_async};
pub use worker::{RemoteCallError, RemoteFunction, WorkerConfig, run_worker, serve_stdio};
