//! refunc-broker — routes calls on public endpoints to function instances.
//!
//! Subscribes to `refunc.{ns}.*` on a message bus, resolves each call through
//! an [`Operator`], and either forwards it to a live instance or wakes the
//! instance first. See [`broker`] for the per-call state machine and [`wake`]
//! for the cold-start rendezvous.

pub mod broker;
pub mod builtins;
pub mod local;
pub mod operator;
pub mod wake;

pub use broker::{Broker, BrokerError};
pub use builtins::{BuiltinHandler, Builtins};
pub use local::LocalOperator;
pub use operator::{Operator, ResolveError};
pub use wake::{WakeGuard, WakeSignals};
