//! Operator seam — how the broker resolves an endpoint to a live instance.

use async_trait::async_trait;
use refunc_core::model::{FuncDef, FuncInstance, Trigger};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no trigger for endpoint {0}")]
    NoTrigger(String),
    #[error("funcdef {0} not found")]
    NoFuncdef(String),
    #[error("no instance for {0}")]
    NoInstance(String),
    #[error("operator unavailable, {0}")]
    Unavailable(String),
}

/// Cluster-side collaborator of the broker.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Namespace this operator serves. Empty serves all namespaces.
    fn namespace(&self) -> &str;

    async fn trigger_for_endpoint(&self, endpoint: &str) -> Result<Trigger, ResolveError>;

    async fn resolve_funcdef(&self, trigger: &Trigger) -> Result<FuncDef, ResolveError>;

    /// Current instance for `trigger`, status included.
    async fn get_func_instance(&self, trigger: &Trigger) -> Result<FuncInstance, ResolveError>;

    /// Keep-alive for the instance keyed `ns/name`.
    fn tap(&self, key: &str);
}
