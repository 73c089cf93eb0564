//! Gateway handlers — task creation, live call listing, function metadata.

pub mod meta;
pub mod tasks;

use std::time::Duration;

use refunc_client::{InvocationContext, LiveTaskStore};

pub use meta::handle_meta;
pub use tasks::{handle_create_task, handle_list_tasks};

/// How often a waiting long-poll gets a ping frame.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

pub(crate) const JSON_CT: &str = "application/json; charset=utf-8";

#[derive(Clone)]
pub struct GatewayState {
    /// Base context every call is derived from; carries the transport.
    pub ctx: InvocationContext,
    /// Calls in flight, keyed `{ns}/{name}/{requestId}`.
    pub store: LiveTaskStore,
    pub ping_interval: Duration,
}

impl GatewayState {
    pub fn new(ctx: InvocationContext) -> Self {
        Self {
            ctx,
            store: LiveTaskStore::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_ping_interval(mut self, every: Duration) -> Self {
        self.ping_interval = every;
        self
    }
}
