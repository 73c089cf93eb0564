//! Reply parsing shared by every transport.

use bytes::Bytes;
use refunc_core::{Action, ActionType, ErrorMessage, InvokeResponse};

use crate::error::TaskError;

/// Receiver of parsed frames.
pub trait TaskParser {
    /// Settle with a result or error. Only the first call has any effect.
    fn set_result(&self, result: Result<Bytes, TaskError>);
    /// Append one line to the log stream.
    fn update_log(&self, line: String);
    /// Append one emitted message to the message stream.
    fn publish_message(&self, _msg: Bytes) {}
}

/// Decode one frame and dispatch it to `p`.
///
/// Returns `true` when more frames are expected (log, emit, ping) and `false`
/// once `p` has been settled.
///
/// An `rsp` frame whose payload is not an `InvokeResponse` comes from an older
/// producer: the result is the frame's raw `p` bytes, not the whole frame.
pub fn parse_action(raw: &[u8], p: &dyn TaskParser) -> bool {
    let action: Action = match serde_json::from_slice(raw) {
        Ok(action) => action,
        Err(e) => {
            let err = if raw.len() < 256 && is_printable(raw) {
                TaskError::Protocol(String::from_utf8_lossy(raw).into_owned())
            } else {
                TaskError::Protocol(format!("invalid response, {}", e))
            };
            p.set_result(Err(err));
            return false;
        }
    };

    let payload = action.payload_bytes();
    match action.kind {
        ActionType::Error => match serde_json::from_slice::<ErrorMessage>(payload) {
            Ok(msg) => p.set_result(Err(TaskError::Remote(msg))),
            Err(_) => p.set_result(Err(json_error(payload))),
        },

        ActionType::Response => match serde_json::from_slice::<InvokeResponse>(payload) {
            Ok(InvokeResponse { error: Some(msg), .. }) => p.set_result(Err(TaskError::Remote(msg))),
            Ok(rsp) => {
                let data = rsp
                    .payload
                    .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
                    .unwrap_or_default();
                p.set_result(Ok(data));
            }
            // Older producers put the bare result in the payload.
            Err(_) if !is_empty_json(payload) => p.set_result(Ok(Bytes::copy_from_slice(payload))),
            Err(_) => p.set_result(Err(json_error(payload))),
        },

        ActionType::Log => {
            p.update_log(unquote(payload));
            return true;
        }

        ActionType::Emit => {
            p.publish_message(Bytes::copy_from_slice(payload));
            return true;
        }

        ActionType::Ping => return true,

        other => p.set_result(Err(TaskError::Protocol(format!(
            "unsupported action type: {:?}",
            other.as_str()
        )))),
    }
    false
}

fn json_error(payload: &[u8]) -> TaskError {
    TaskError::Protocol(format!("json error, {}", unquote(payload)))
}

/// Decode a JSON string, or fall back to the raw text.
pub fn unquote(bytes: &[u8]) -> String {
    serde_json::from_slice::<String>(bytes)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

fn is_printable(raw: &[u8]) -> bool {
    std::str::from_utf8(raw)
        .map(|s| s.chars().all(|c| !c.is_control()))
        .unwrap_or(false)
}

fn is_empty_json(payload: &[u8]) -> bool {
    matches!(
        payload.trim_ascii(),
        b"" | b"null" | b"{}" | b"[]" | b"\"\""
    )
}
