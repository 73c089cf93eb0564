//! Bus subject naming.
//!
//! ```text
//! refunc.{ns}.{name}                     public invocation entry
//! refunc.{ns}.{name}._meta               metadata query
//! _refunc._insts_.{ns}.{name}            private instance subject
//! _refunc._insts_.{ns}.{name}._cry_      poke a sleeping instance
//! _refunc._cry_.{ns}/{name}              instance announces readiness
//! _refunc._tap_.{ns}/{name}              keep-alive tap
//! _refunc.forwardlogs.{ns}.{name}.{id}   per-call log side channel
//! ```
//!
//! Endpoints are written `ns/name` by callers; on the bus the slash becomes a dot.

use crate::messages::WireError;
use crate::model::INTERNAL_PREFIX;

pub const PUBLIC_PREFIX: &str = "refunc";
pub const META_PATH: &str = "_meta";
pub const BUILTINS_NAMESPACE: &str = "builtins";

pub const CRY_PREFIX: &str = "_refunc._cry_.";
pub const TAP_PREFIX: &str = "_refunc._tap_.";
pub const FORWARD_LOGS_PREFIX: &str = "_refunc.forwardlogs.";

/// Subject a caller publishes an invocation of `endpoint` to.
pub fn invoke_subject(endpoint: &str) -> String {
    format!("{}.{}", PUBLIC_PREFIX, endpoint.replace('/', "."))
}

pub fn meta_subject(endpoint: &str) -> String {
    format!("{}.{}", invoke_subject(endpoint), META_PATH)
}

/// Unique per-call log subject.
pub fn forward_logs_subject(endpoint: &str, unique: &str) -> String {
    format!("{}{}.{}", FORWARD_LOGS_PREFIX, endpoint.replace('/', "."), unique)
}

/// Wildcard the broker subscribes to. Empty namespace serves all namespaces.
pub fn request_wildcard(namespace: &str) -> String {
    if namespace.is_empty() {
        format!("{}.*.*", PUBLIC_PREFIX)
    } else {
        format!("{}.{}.*", PUBLIC_PREFIX, namespace)
    }
}

/// Wildcard for metadata queries. Empty namespace serves all namespaces.
pub fn meta_wildcard(namespace: &str) -> String {
    if namespace.is_empty() {
        format!("{}.*.*.{}", PUBLIC_PREFIX, META_PATH)
    } else {
        format!("{}.{}.*.{}", PUBLIC_PREFIX, namespace, META_PATH)
    }
}

pub fn cry_wildcard() -> String {
    format!("{}*", CRY_PREFIX)
}

pub fn tap_wildcard() -> String {
    format!("{}*", TAP_PREFIX)
}

/// Unique reply subject for a request/reply exchange.
pub fn inbox(unique: &str) -> String {
    format!("{}._inbox_.{}", INTERNAL_PREFIX, unique)
}

/// A public invocation subject, split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub namespace: String,
    pub name: String,
    /// Sub-path after the name, e.g. `_meta`. Empty for a plain call.
    pub path: String,
}

impl Topic {
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_meta(&self) -> bool {
        self.path == META_PATH
    }

    pub fn is_builtin(&self) -> bool {
        self.namespace == BUILTINS_NAMESPACE
    }
}

/// Split `refunc.{ns}.{name}[.{path}]`.
pub fn split_topic(subject: &str) -> Result<Topic, WireError> {
    let rest = subject
        .strip_prefix(PUBLIC_PREFIX)
        .and_then(|s| s.strip_prefix('.'))
        .ok_or_else(|| WireError::InvalidSubject(subject.to_string()))?;
    let mut parts = rest.splitn(3, '.');
    let namespace = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    if namespace.is_empty() || name.is_empty() {
        return Err(WireError::InvalidSubject(subject.to_string()));
    }
    Ok(Topic {
        namespace: namespace.to_string(),
        name: name.to_string(),
        path: path.to_string(),
    })
}

/// Parse `{ns}/{name}` out of a cry or tap subject. Anything else is rejected.
pub fn parse_instance_key<'a>(subject: &'a str, prefix: &str) -> Result<(&'a str, &'a str), WireError> {
    let key = subject
        .strip_prefix(prefix)
        .ok_or_else(|| WireError::InvalidSubject(subject.to_string()))?;
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(WireError::InvalidSubject(subject.to_string())),
    }
}

/// NATS-style subject match: `*` matches one token, a trailing `>` matches
/// one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
