//! Resource model — the slice of the cluster's function resources the broker
//! needs to route a call: trigger, function definition, and live instance.

use serde::{Deserialize, Serialize};

/// Prefix for every private, platform-internal subject.
pub const INTERNAL_PREFIX: &str = "_refunc";

// ── Resources ─────────────────────────────────────────────────────────────────

/// Binds a public endpoint to a function definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub namespace: String,
    pub name: String,
    /// Name of the `FuncDef` in the same namespace.
    pub func_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncDef {
    pub namespace: String,
    pub name: String,
    /// Per-call timeout in seconds. 0 = platform default.
    #[serde(default)]
    pub timeout_secs: u64,
}

impl FuncDef {
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A concrete, possibly scaled-to-zero deployment of a `FuncDef`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncInstance {
    pub namespace: String,
    pub name: String,
    pub funcdef_namespace: String,
    pub funcdef_name: String,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl FuncInstance {
    /// Private request subject of this instance.
    pub fn service_endpoint(&self) -> String {
        format!(
            "{}._insts_.{}.{}",
            INTERNAL_PREFIX, self.funcdef_namespace, self.name
        )
    }

    /// Subject a sleeping instance listens on for pokes.
    pub fn cry_service_endpoint(&self) -> String {
        format!("{}._cry_", self.service_endpoint())
    }

    /// Subject the instance announces readiness on. Also the wake-record key.
    pub fn crying_endpoint(&self) -> String {
        format!("{}._cry_.{}/{}", INTERNAL_PREFIX, self.namespace, self.name)
    }

    /// Subject keep-alive taps are published on.
    pub fn tapping_endpoint(&self) -> String {
        format!("{}._tap_.{}/{}", INTERNAL_PREFIX, self.namespace, self.name)
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Number of backends currently able to take a request.
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Inactive,
    Pending,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(kind: ConditionType, status: ConditionStatus, reason: &str) -> Self {
        Self {
            kind,
            status,
            reason: reason.to_string(),
            message: String::new(),
        }
    }
}

pub const REASON_XENV_NOT_RESOLVED: &str = "XenvNotResolved";
pub const REASON_REPLICASET_NOT_READY: &str = "ReplicasetNotReady";

impl InstanceStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Returns a description of the first condition that means the instance
    /// will never come online for this call, if any.
    pub fn terminal_failure(&self) -> Option<String> {
        if let Some(c) = self.condition(ConditionType::Inactive) {
            if c.status == ConditionStatus::True {
                return Some(describe("inactive", c));
            }
        }
        if let Some(c) = self.condition(ConditionType::Pending) {
            if c.status == ConditionStatus::True && c.reason == REASON_XENV_NOT_RESOLVED {
                return Some(describe("pending", c));
            }
        }
        if let Some(c) = self.condition(ConditionType::Active) {
            if c.status == ConditionStatus::False && c.reason == REASON_REPLICASET_NOT_READY {
                return Some(describe("not ready", c));
            }
        }
        None
    }
}

fn describe(state: &str, c: &Condition) -> String {
    match (c.reason.is_empty(), c.message.is_empty()) {
        (true, true) => format!("instance {}", state),
        (false, true) => format!("instance {}, {}", state, c.reason),
        (_, false) => format!("instance {}, {}: {}", state, c.reason, c.message),
    }
}
