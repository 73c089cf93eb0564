//! Builtin functions — endpoints under `builtins/` answered by the broker.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use refunc_core::messages::encode;
use refunc_core::{Action, ErrorMessage, InvokeRequest};
use serde_json::{json, Value};

use crate::broker::BrokerError;

pub type BuiltinHandler = Arc<dyn Fn(&InvokeRequest) -> Result<Value, ErrorMessage> + Send + Sync>;

struct Builtin {
    meta: String,
    handler: BuiltinHandler,
}

/// Registry of builtin handlers. `Default` comes with `helloworld` and
/// `cluster-info` registered.
#[derive(Clone)]
pub struct Builtins {
    handlers: Arc<DashMap<String, Builtin>>,
}

impl Default for Builtins {
    fn default() -> Self {
        let b = Self::empty();
        b.register("helloworld", "", |_| Ok(json!({ "message": "Hello world!" })));
        b.register("cluster-info", "", |_| {
            Ok(json!({ "refuncVersion": env!("CARGO_PKG_VERSION") }))
        });
        b
    }
}

impl Builtins {
    pub fn empty() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
        }
    }

    pub fn register<F>(&self, name: &str, meta: &str, handler: F)
    where
        F: Fn(&InvokeRequest) -> Result<Value, ErrorMessage> + Send + Sync + 'static,
    {
        self.handlers.insert(
            name.to_string(),
            Builtin {
                meta: meta.to_string(),
                handler: Arc::new(handler),
            },
        );
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn meta(&self, name: &str) -> Option<String> {
        self.handlers.get(name).map(|b| b.meta.clone())
    }

    /// Run builtin `name` on a raw request and return the encoded `rsp` frame.
    pub fn handle(&self, name: &str, raw: &[u8]) -> Result<Bytes, BrokerError> {
        let handler = self
            .handlers
            .get(name)
            .map(|b| b.handler.clone())
            .ok_or_else(|| BrokerError::BuiltinNotFound(name.to_string()))?;
        let request: InvokeRequest = serde_json::from_slice(raw)?;
        let value = handler(&request).map_err(BrokerError::Remote)?;
        Ok(encode(&Action::response(&value)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refunc_core::InvokeResponse;

    fn decode(frame: &[u8]) -> Value {
        let action: Action = serde_json::from_slice(refunc_core::messages::trim_crlf(frame)).unwrap();
        let rsp: InvokeResponse = serde_json::from_slice(action.payload_bytes()).unwrap();
        serde_json::from_str(rsp.payload.unwrap().get()).unwrap()
    }

    #[test]
    fn defaults_are_registered() {
        let b = Builtins::default();
        assert_eq!(b.list(), vec!["cluster-info", "helloworld"]);
        let out = b.handle("helloworld", b"{}").unwrap();
        assert_eq!(decode(&out)["message"], "Hello world!");
        assert!(decode(&b.handle("cluster-info", b"{}").unwrap())["refuncVersion"].is_string());
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        let err = Builtins::default().handle("nope", b"{}").unwrap_err();
        assert!(matches!(err, BrokerError::BuiltinNotFound(_)));
    }

    #[test]
    fn handler_error_is_carried() {
        let b = Builtins::empty();
        b.register("fail", "always fails", |_| Err(ErrorMessage::new("Boom", "no")));
        assert_eq!(b.meta("fail").as_deref(), Some("always fails"));
        match b.handle("fail", b"{}").unwrap_err() {
            BrokerError::Remote(msg) => assert_eq!(msg.error_type, "Boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn args_reach_the_handler() {
        let b = Builtins::empty();
        b.register("echo", "", |req| Ok(serde_json::from_slice(req.args_bytes()).unwrap_or(Value::Null)));
        let out = b.handle("echo", br#"{"args":{"x":1}}"#).unwrap();
        assert_eq!(decode(&out), json!({"x": 1}));
    }
}
