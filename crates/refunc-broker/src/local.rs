//! In-memory operator — function resources held in process.
//!
//! Each registered function gets a trigger of the same name and a single
//! instance. Instance status is updated by whoever runs the workers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use refunc_core::config::FunctionConfig;
use refunc_core::model::{Condition, FuncDef, FuncInstance, InstanceStatus, Trigger};

use crate::operator::{Operator, ResolveError};

#[derive(Debug, Clone)]
struct Tap {
    last: DateTime<Utc>,
    count: u64,
}

#[derive(Clone, Default)]
pub struct LocalOperator {
    namespace: String,
    triggers: Arc<DashMap<String, Trigger>>,
    funcdefs: Arc<DashMap<String, FuncDef>>,
    instances: Arc<DashMap<String, FuncInstance>>,
    taps: Arc<DashMap<String, Tap>>,
}

impl LocalOperator {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn from_config(namespace: &str, functions: &[FunctionConfig]) -> Self {
        let op = Self::new(namespace);
        for f in functions {
            op.register(FuncDef {
                namespace: f.namespace.clone(),
                name: f.name.clone(),
                timeout_secs: f.timeout_secs,
            });
        }
        op
    }

    /// Add a function with a same-named trigger and a scaled-to-zero instance.
    pub fn register(&self, funcdef: FuncDef) -> FuncInstance {
        let endpoint = funcdef.endpoint();
        let instance = FuncInstance {
            namespace: funcdef.namespace.clone(),
            name: funcdef.name.clone(),
            funcdef_namespace: funcdef.namespace.clone(),
            funcdef_name: funcdef.name.clone(),
            status: InstanceStatus::default(),
        };
        self.triggers.insert(
            endpoint.clone(),
            Trigger {
                namespace: funcdef.namespace.clone(),
                name: funcdef.name.clone(),
                func_name: funcdef.name.clone(),
            },
        );
        self.funcdefs.insert(endpoint.clone(), funcdef);
        self.instances.insert(endpoint.clone(), instance.clone());
        tracing::debug!(endpoint = %endpoint, "function registered");
        instance
    }

    pub fn instance(&self, endpoint: &str) -> Option<FuncInstance> {
        self.instances.get(endpoint).map(|i| i.clone())
    }

    pub fn funcdefs(&self) -> Vec<FuncDef> {
        let mut defs: Vec<FuncDef> = self.funcdefs.iter().map(|d| d.value().clone()).collect();
        defs.sort_by_key(|d| d.endpoint());
        defs
    }

    /// Set the number of active backends of the instance behind `endpoint`.
    pub fn set_active(&self, endpoint: &str, active: u32) {
        if let Some(mut inst) = self.instances.get_mut(endpoint) {
            inst.status.active = active;
        }
    }

    pub fn set_conditions(&self, endpoint: &str, conditions: Vec<Condition>) {
        if let Some(mut inst) = self.instances.get_mut(endpoint) {
            inst.status.conditions = conditions;
        }
    }

    pub fn last_tap(&self, key: &str) -> Option<DateTime<Utc>> {
        self.taps.get(key).map(|t| t.last)
    }

    pub fn tap_count(&self, key: &str) -> u64 {
        self.taps.get(key).map(|t| t.count).unwrap_or(0)
    }
}

#[async_trait]
impl Operator for LocalOperator {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn trigger_for_endpoint(&self, endpoint: &str) -> Result<Trigger, ResolveError> {
        self.triggers
            .get(endpoint)
            .map(|t| t.clone())
            .ok_or_else(|| ResolveError::NoTrigger(endpoint.to_string()))
    }

    async fn resolve_funcdef(&self, trigger: &Trigger) -> Result<FuncDef, ResolveError> {
        let key = format!("{}/{}", trigger.namespace, trigger.func_name);
        self.funcdefs
            .get(&key)
            .map(|d| d.clone())
            .ok_or(ResolveError::NoFuncdef(key))
    }

    async fn get_func_instance(&self, trigger: &Trigger) -> Result<FuncInstance, ResolveError> {
        let key = format!("{}/{}", trigger.namespace, trigger.func_name);
        self.instances
            .get(&key)
            .map(|i| i.clone())
            .ok_or(ResolveError::NoInstance(key))
    }

    fn tap(&self, key: &str) {
        let now = Utc::now();
        self.taps
            .entry(key.to_string())
            .and_modify(|t| {
                t.last = now;
                t.count += 1;
            })
            .or_insert(Tap { last: now, count: 1 });
    }
}
