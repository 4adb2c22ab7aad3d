//! The contract an embedded interpreter fulfils for the worker.
//!
//! The engine runs on the worker thread only, so it need not be `Send`. All
//! methods take `&self`; engines keep their mutable state behind `RefCell` and
//! must not hold a borrow across an await, since a nested call to the controller
//! suspends `run` while other frames are still being dispatched.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::bridge::protocol::Completions;
use crate::interrupt::InterruptSignal;
use crate::worker::RemoteFunction;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The program raised; the message is the textual traceback.
    #[error("{0}")]
    Raised(String),

    /// The interrupt flag was observed at a polling point.
    #[error("KeyboardInterrupt")]
    Interrupted,

    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),
}

impl EngineError {
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised(message.into())
    }
}

/// Captured result of running a program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub result: Value,
    pub stdout: String,
    pub stderr: String,
}

/// A value bound into the program's globals for the duration of one exec.
#[derive(Clone)]
pub enum Binding {
    Value(Value),
    Function(RemoteFunction),
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Function(function) => f.debug_tuple("Function").field(&function.name()).finish(),
        }
    }
}

#[async_trait(?Send)]
pub trait Engine: 'static {
    /// Load the interpreter. A failure is reported to the controller as a setup failure.
    async fn bootstrap(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Offer the shared interrupt flag. Returns whether the engine will poll it.
    fn register_interrupt(&self, _signal: InterruptSignal) -> bool {
        false
    }

    fn bind(&self, name: &str, binding: Binding);

    fn unbind(&self, name: &str);

    async fn run(&self, code: &str) -> Result<RunOutput, EngineError>;

    /// `line` is 1-based; `column` counts characters.
    async fn complete(&self, code: &str, line: u32, column: u32)
    -> Result<Completions, EngineError>;

    async fn install(&self, package: &str) -> Result<(), EngineError>;

    async fn format(&self, code: &str, options: &Map<String, Value>)
    -> Result<String, EngineError>;

    /// Render an error for the controller. Engines that post-process tracebacks override this.
    fn describe_error(&self, error: &EngineError) -> String {
        error.to_string()
    }
}
