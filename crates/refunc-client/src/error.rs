//! Error types for resolvers and the message bus.

use std::any::Any;
use std::backtrace::Backtrace;

use refunc_core::{ErrorMessage, WireError};

/// Settlement error of a task resolver.
///
/// `Clone` so a settled result can be handed out any number of times.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task: stopped")]
    Stopped,
    #[error("task: empty response")]
    EmptyResponse,
    #[error("task: input stream is nil")]
    NilInputStream,
    #[error("task: output stream is nil")]
    NilOutputStream,
    /// The function itself failed. Carried verbatim.
    #[error("{0}")]
    Remote(ErrorMessage),
    /// Malformed or undecodable frame.
    #[error("task: {0}")]
    Protocol(String),
    /// Connection level failure.
    #[error("task: {0}")]
    Transport(String),
    #[error("task: deadline exceeded")]
    DeadlineExceeded,
    #[error("task: closing bumper timeout")]
    CloseTimeout,
    #[error("task: panic, {message}")]
    Panic { message: String, backtrace: String },
    #[error("task: {0}")]
    Config(String),
}

impl TaskError {
    /// Stable name used as `errorType` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Stopped => "Stopped",
            TaskError::EmptyResponse => "EmptyResponse",
            TaskError::NilInputStream => "NilInputStream",
            TaskError::NilOutputStream => "NilOutputStream",
            TaskError::Remote(_) => "Remote",
            TaskError::Protocol(_) => "Protocol",
            TaskError::Transport(_) => "Transport",
            TaskError::DeadlineExceeded => "DeadlineExceeded",
            TaskError::CloseTimeout => "CloseTimeout",
            TaskError::Panic { .. } => "Panic",
            TaskError::Config(_) => "Config",
        }
    }

    /// True for a local deadline and for a remote one reported by the broker.
    pub fn is_deadline(&self) -> bool {
        match self {
            TaskError::DeadlineExceeded => true,
            TaskError::Remote(msg) => msg.error_type == "DeadlineExceeded",
            _ => false,
        }
    }

    /// Build from a caught panic payload, capturing a backtrace at the
    /// catching task boundary.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panic {
            message,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    /// Wire form for an `err` frame.
    pub fn to_error_message(&self) -> ErrorMessage {
        match self {
            TaskError::Remote(msg) => msg.clone(),
            TaskError::Panic { backtrace, .. } => ErrorMessage {
                message: self.to_string(),
                error_type: self.kind().to_string(),
                stack_trace: backtrace
                    .lines()
                    .map(|l| serde_json::Value::String(l.trim().to_string()))
                    .collect(),
                fatal: false,
            },
            other => ErrorMessage::new(other.kind(), other.to_string()),
        }
    }
}

impl From<ErrorMessage> for TaskError {
    fn from(msg: ErrorMessage) -> Self {
        TaskError::Remote(msg)
    }
}

impl From<&TaskError> for ErrorMessage {
    fn from(err: &TaskError) -> Self {
        err.to_error_message()
    }
}

impl From<WireError> for TaskError {
    fn from(err: WireError) -> Self {
        TaskError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Protocol(format!("json error, {}", err))
    }
}

impl From<BusError> for TaskError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => TaskError::DeadlineExceeded,
            other => TaskError::Transport(other.to_string()),
        }
    }
}

/// Message bus failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus: connection closed")]
    Closed,
    #[error("bus: no responders for {0}")]
    NoResponders(String),
    #[error("bus: request timed out")]
    Timeout,
    #[error("bus: invalid subject {0:?}")]
    InvalidSubject(String),
}
