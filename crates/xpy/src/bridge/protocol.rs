//! Wire protocol types for controller-worker communication.
//!
//! Every frame is a JSON object tagged by `action`. Both directions carry a
//! correlation id, but the two id spaces are independent: the controller numbers
//! top-level commands, the worker numbers its nested function calls. Routing is
//! decided by the frame's action, never by the id value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ties a command to its eventual response within one direction.
pub type CorrelationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Exec,
    Complete,
    Install,
    Format,
    FunctionCall,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Complete => "complete",
            Self::Install => "install",
            Self::Format => "format",
            Self::FunctionCall => "function_call",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionTag {
    #[serde(rename = "function-reference")]
    FunctionReference,
}

/// Serializable stand-in for a controller-side callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionRef {
    pub tag: FunctionTag,
    pub name: String,
}

impl FunctionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tag: FunctionTag::FunctionReference,
            name: name.into(),
        }
    }
}

/// A context entry as it crosses the wire: plain data or a function reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Function(FunctionRef),
    Value(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPayload {
    pub code: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, ContextValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl CompletePayload {
    /// Cursor position (1-based line, character column), defaulting to the end
    /// of the last line.
    pub fn cursor(&self) -> (u32, u32) {
        let lines: Vec<&str> = self.code.split('\n').collect();
        let line = match self.line {
            Some(line) => line.clamp(1, lines.len() as u32),
            None => lines.len() as u32,
        };
        let column = self
            .column
            .unwrap_or_else(|| lines[(line - 1) as usize].chars().count() as u32);
        (line, column)
    }

    /// Copy with the cursor filled in.
    pub fn normalized(self) -> Self {
        let (line, column) = self.cursor();
        Self {
            code: self.code,
            line: Some(line),
            column: Some(column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPayload {
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatPayload {
    pub code: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Nested call request: the running program invoked a controller function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Reply to a nested call. `error` wins over `result` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionReply {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl FunctionReply {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub result: Option<serde_json::Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn success(result: serde_json::Value, stdout: String, stderr: String) -> Self {
        Self {
            result: Some(result),
            stdout: Some(stdout),
            stderr: Some(stderr),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMatch {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completions {
    pub matches: Vec<CompletionMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteOutcome {
    pub result: Option<Completions>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOutcome {
    pub result: Option<String>,
    pub error: Option<String>,
}

/// A top-level command, as submitted by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Exec(ExecPayload),
    Complete(CompletePayload),
    Install(InstallPayload),
    Format(FormatPayload),
}

impl Command {
    pub fn action(&self) -> ActionKind {
        match self {
            Self::Exec(_) => ActionKind::Exec,
            Self::Complete(_) => ActionKind::Complete,
            Self::Install(_) => ActionKind::Install,
            Self::Format(_) => ActionKind::Format,
        }
    }
}

/// The worker's answer to a top-level command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Exec(ExecOutcome),
    Complete(CompleteOutcome),
    Install(InstallOutcome),
    Format(FormatOutcome),
}

impl Reply {
    pub fn action(&self) -> ActionKind {
        match self {
            Self::Exec(_) => ActionKind::Exec,
            Self::Complete(_) => ActionKind::Complete,
            Self::Install(_) => ActionKind::Install,
            Self::Format(_) => ActionKind::Format,
        }
    }
}

/// Frames from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToWorker {
    Exec {
        id: CorrelationId,
        data: ExecPayload,
    },
    Complete {
        id: CorrelationId,
        data: CompletePayload,
    },
    Install {
        id: CorrelationId,
        data: InstallPayload,
    },
    Format {
        id: CorrelationId,
        data: FormatPayload,
    },
    /// Reply to a nested call; `id` is the worker's own id for that call.
    FunctionCall {
        id: CorrelationId,
        data: FunctionReply,
    },
    Shutdown,
}

impl ToWorker {
    pub fn command(id: CorrelationId, command: Command) -> Self {
        match command {
            Command::Exec(data) => Self::Exec { id, data },
            Command::Complete(data) => Self::Complete { id, data },
            Command::Install(data) => Self::Install { id, data },
            Command::Format(data) => Self::Format { id, data },
        }
    }

    /// Split off a top-level command; nested-call replies and shutdown come back unchanged.
    pub fn into_command(self) -> Result<(CorrelationId, Command), Self> {
        match self {
            Self::Exec { id, data } => Ok((id, Command::Exec(data))),
            Self::Complete { id, data } => Ok((id, Command::Complete(data))),
            Self::Install { id, data } => Ok((id, Command::Install(data))),
            Self::Format { id, data } => Ok((id, Command::Format(data))),
            other => Err(other),
        }
    }
}

/// Frames from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToController {
    /// Readiness handshake, sent once after the engine has bootstrapped.
    /// `interrupt` reports whether the engine accepted the shared interrupt flag.
    Ready {
        interrupt: bool,
    },

    /// Engine bootstrap failed; the worker exits after sending this.
    SetupFailed {
        error: String,
    },

    Exec {
        id: CorrelationId,
        data: ExecOutcome,
    },
    Complete {
        id: CorrelationId,
        data: CompleteOutcome,
    },
    Install {
        id: CorrelationId,
        data: InstallOutcome,
    },
    Format {
        id: CorrelationId,
        data: FormatOutcome,
    },

    /// Nested call request issued by the running program.
    FunctionCall {
        id: CorrelationId,
        data: FunctionCallRequest,
    },

    /// Worker tracing event shipped to the controller.
    WorkerLog {
        target: String,
        level: String,
        message: String,
    },
}

impl ToController {
    pub fn reply(id: CorrelationId, reply: Reply) -> Self {
        match reply {
            Reply::Exec(data) => Self::Exec { id, data },
            Reply::Complete(data) => Self::Complete { id, data },
            Reply::Install(data) => Self::Install { id, data },
            Reply::Format(data) => Self::Format { id, data },
        }
    }

    /// Split off a top-level response; other frames are handed back unchanged.
    pub fn into_reply(self) -> Result<(CorrelationId, Reply), Self> {
        match self {
            Self::Exec { id, data } => Ok((id, Reply::Exec(data))),
            Self::Complete { id, data } => Ok((id, Reply::Complete(data))),
            Self::Install { id, data } => Ok((id, Reply::Install(data))),
            Self::Format { id, data } => Ok((id, Reply::Format(data))),
            other => Err(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::SetupFailed { .. } => "setup_failed",
            Self::Exec { .. } => "exec",
            Self::Complete { .. } => "complete",
            Self::Install { .. } => "install",
            Self::Format { .. } => "format",
            Self::FunctionCall { .. } => "function_call",
            Self::WorkerLog { .. } => "worker_log",
        }
    }
}
