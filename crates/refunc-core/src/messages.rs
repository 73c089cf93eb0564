//! Refunc wire envelope — the frame every transport speaks.
//!
//! One JSON object per line, CRLF-terminated:
//!
//! ```text
//! {"a":"req","p":{"args":{...},"rid":"..."}}\r\n
//! ```
//!
//! The same bytes travel over a worker's stdin/stdout, an HTTP chunked body,
//! and a bus message payload. Field names and action tags are part of the
//! protocol and must not change.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Largest single frame a reader accepts.
pub const MAX_PAYLOAD_SIZE: usize = 6 << 20;

/// No invocation may outlive this, whatever its deadline says.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Deadline applied to requests that arrive without one.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(9 * 60);

/// Frame terminator.
pub const TOKEN_CRLF: &[u8] = b"\r\n";

/// Pre-encoded ping frame.
pub const PING_MSG: &[u8] = b"{\"a\":\"_ping\"}\r\n";

/// Request option naming the subject a function should send its log lines to.
pub const LOG_ENDPOINT_OPTION: &str = "logEndpoint";

// ── Action ────────────────────────────────────────────────────────────────────

/// Frame discriminator, the `"a"` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionType {
    /// Payload is an `InvokeRequest`.
    Request,
    /// Payload is an `InvokeResponse`.
    Response,
    /// Payload is an emitted message.
    Emit,
    /// Payload is a single log line.
    Log,
    /// Payload is an `ErrorMessage`; the exchange ends.
    Error,
    Ping,
    /// Any tag this build does not know. Kept so the parser can report it.
    Other(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::Request => "req",
            ActionType::Response => "rsp",
            ActionType::Emit => "emit",
            ActionType::Log => "log",
            ActionType::Error => "err",
            ActionType::Ping => "_ping",
            ActionType::Other(tag) => tag,
        }
    }
}

impl From<&str> for ActionType {
    fn from(tag: &str) -> Self {
        match tag {
            "req" => ActionType::Request,
            "rsp" => ActionType::Response,
            "emit" => ActionType::Emit,
            "log" => ActionType::Log,
            "err" => ActionType::Error,
            "_ping" => ActionType::Ping,
            other => ActionType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ActionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(ActionType::from(tag.as_str()))
    }
}

/// The basic unit exchanged between a caller, the broker, and a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "a")]
    pub kind: ActionType,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl Action {
    /// Build an action whose payload is `value` serialized as JSON.
    pub fn new<T: Serialize + ?Sized>(kind: ActionType, value: &T) -> Result<Self, WireError> {
        Ok(Self {
            kind,
            payload: Some(serde_json::value::to_raw_value(value)?),
        })
    }

    pub fn ping() -> Self {
        Self {
            kind: ActionType::Ping,
            payload: None,
        }
    }

    /// A `log` frame carrying one line as a JSON string.
    pub fn log(line: &str) -> Result<Self, WireError> {
        Self::new(ActionType::Log, line)
    }

    /// A terminal `err` frame.
    pub fn error(err: &ErrorMessage) -> Result<Self, WireError> {
        Self::new(ActionType::Error, err)
    }

    /// A terminal `rsp` frame wrapping `payload` in an `InvokeResponse`.
    pub fn response<T: Serialize + ?Sized>(payload: &T) -> Result<Self, WireError> {
        let rsp = InvokeResponse {
            payload: Some(serde_json::value::to_raw_value(payload)?),
            ..Default::default()
        };
        Self::new(ActionType::Response, &rsp)
    }

    /// Raw payload bytes, empty when the frame has no payload.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload
            .as_ref()
            .map(|p| p.get().as_bytes())
            .unwrap_or_default()
    }
}

/// Encode an action as one CRLF-terminated line.
pub fn encode(action: &Action) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(action)?;
    let mut buf = BytesMut::with_capacity(json.len() + TOKEN_CRLF.len());
    buf.put_slice(&json);
    buf.put_slice(TOKEN_CRLF);
    Ok(buf.freeze())
}

/// Encode an `err` frame for `err`. Never fails: a frame that cannot be
/// serialized degrades to a minimal hand-built one.
pub fn error_action_bytes(err: &ErrorMessage) -> Bytes {
    match Action::error(err).and_then(|a| encode(&a)) {
        Ok(bytes) => bytes,
        Err(_) => Bytes::from_static(b"{\"a\":\"err\",\"p\":{\"errorMessage\":\"encode failed\",\"fatal\":false}}\r\n"),
    }
}

/// Encode a terminal `rsp` frame carrying `data` as the payload. Bytes that
/// are not valid JSON are sent as a JSON string.
pub fn response_action_bytes(data: &[u8]) -> Bytes {
    let payload = if data.is_empty() {
        None
    } else {
        serde_json::from_slice::<Box<RawValue>>(data)
            .or_else(|_| serde_json::value::to_raw_value(&String::from_utf8_lossy(data)))
            .ok()
    };
    let rsp = InvokeResponse {
        payload,
        ..Default::default()
    };
    match Action::new(ActionType::Response, &rsp).and_then(|a| encode(&a)) {
        Ok(bytes) => bytes,
        Err(e) => error_action_bytes(&ErrorMessage::new("Protocol", e.to_string())),
    }
}

/// Strip one trailing CRLF (or bare LF) from `line`.
pub fn trim_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(TOKEN_CRLF)
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Data handed to a function invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub args: Option<Box<RawValue>>,
    #[serde(rename = "rid", default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(rename = "tid", default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    /// Absolute deadline. `None` means "apply `DEFAULT_JOB_TIMEOUT`".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl InvokeRequest {
    pub fn with_args<T: Serialize + ?Sized>(args: &T) -> Result<Self, WireError> {
        Ok(Self {
            args: Some(serde_json::value::to_raw_value(args)?),
            ..Default::default()
        })
    }

    /// Args as raw JSON bytes (`null` when absent).
    pub fn args_bytes(&self) -> &[u8] {
        self.args
            .as_ref()
            .map(|a| a.get().as_bytes())
            .unwrap_or(b"null")
    }

    /// Read a boolean option; anything but a JSON `true` is false.
    pub fn bool_option(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// What a function returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
    #[serde(rename = "ContentType", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

/// Failure information produced during an invocation.
///
/// Implements `std::error::Error`, so a function's own error travels
/// end-to-end as a typed failure rather than as text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "errorMessage", default)]
    pub message: String,
    #[serde(rename = "errorType", default, skip_serializing_if = "String::is_empty")]
    pub error_type: String,
    #[serde(rename = "stackTrace", default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<serde_json::Value>,
    #[serde(default)]
    pub fatal: bool,
}

impl ErrorMessage {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message.is_empty(), self.error_type.is_empty()) {
            (true, true) => f.write_str("<nil>"),
            (true, false) => f.write_str(&self.error_type),
            (false, true) => f.write_str(&self.message),
            (false, false) => write!(f, "{}: {}", self.error_type, self.message),
        }
    }
}

impl std::error::Error for ErrorMessage {}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Derive a 32-hex-char identifier from the given parts.
pub fn gen_id(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let mut id = hex::encode(hasher.finalize().as_bytes());
    id.truncate(32);
    id
}

/// Human readable byte count: `0`, `512B`, `1.5K`, `2M`.
pub fn byte_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1 << 40, "T"),
        (1 << 30, "G"),
        (1 << 20, "M"),
        (1 << 10, "K"),
    ];
    if bytes == 0 {
        return "0".to_string();
    }
    let (value, unit) = UNITS
        .iter()
        .find(|(scale, _)| bytes >= *scale)
        .map(|(scale, unit)| (bytes as f64 / *scale as f64, *unit))
        .unwrap_or((bytes as f64, "B"));
    let text = format!("{:.1}", value);
    format!("{}{}", text.trim_end_matches(".0"), unit)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
}
