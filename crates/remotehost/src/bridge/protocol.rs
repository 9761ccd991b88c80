//! Wire protocol types for parent-worker communication.
//!
//! One channel pair per session:
//! - **Parent → worker**: Call, Shutdown
//! - **Worker → parent**: Result (answers a Call or a Shutdown by correlation id)

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Correlation id of a message.
///
/// UUID v4, generated once when a message is built and never reused. The nil id is reserved
/// for Results that answer no request (startup faults).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every frame carries exactly one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Call(CallMessage),
    Shutdown(ShutdownMessage),
    Result(MessageResult),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Call(m) => m.id,
            Self::Shutdown(m) => m.id,
            Self::Result(m) => m.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call(_) => "call",
            Self::Shutdown(_) => "shutdown",
            Self::Result(_) => "result",
        }
    }
}

impl From<CallMessage> for Message {
    fn from(m: CallMessage) -> Self {
        Self::Call(m)
    }
}

impl From<ShutdownMessage> for Message {
    fn from(m: ShutdownMessage) -> Self {
        Self::Shutdown(m)
    }
}

impl From<MessageResult> for Message {
    fn from(m: MessageResult) -> Self {
        Self::Result(m)
    }
}

/// Invoke `operation` on the hosted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub id: MessageId,
    pub operation: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// When false the worker discards the operation's value and answers with Null.
    pub returns: bool,
}

impl CallMessage {
    pub fn new(operation: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            id: MessageId::new(),
            operation: operation.into(),
            arguments,
            returns: true,
        }
    }

    pub fn without_return(mut self) -> Self {
        self.returns = false;
        self
    }
}

/// Ask the worker to acknowledge and exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownMessage {
    pub id: MessageId,
}

impl ShutdownMessage {
    pub fn new() -> Self {
        Self {
            id: MessageId::new(),
        }
    }
}

impl Default for ShutdownMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// Answer to a Call or Shutdown, correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResult {
    pub id: MessageId,
    pub outcome: Outcome,
}

impl MessageResult {
    pub fn value(id: MessageId, value: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Return(value),
        }
    }

    pub fn fault(id: MessageId, failure: RemoteFailure) -> Self {
        Self {
            id,
            outcome: Outcome::Fault(failure),
        }
    }
}

/// Exactly one of a return value or a failure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Return(Value),
    Fault(RemoteFailure),
}

/// Failure captured in the worker and carried back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The hosted operation returned an error.
    Operation,
    /// The hosted operation panicked.
    Panic,
    /// No operation registered under the requested name.
    UnknownOperation,
    /// Wrong number of arguments.
    Arity,
    /// An argument had the wrong type.
    ArgumentType,
    /// Serializer or hosted type could not be resolved in the worker.
    StartupResolution,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::Panic => "panic",
            Self::UnknownOperation => "unknown_operation",
            Self::Arity => "arity",
            Self::ArgumentType => "argument_type",
            Self::StartupResolution => "startup_resolution",
        }
    }

    /// Faults raised while binding a call to an operation, before the operation runs.
    pub fn is_dispatch(&self) -> bool {
        matches!(self, Self::UnknownOperation | Self::Arity | Self::ArgumentType)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
