//! refuncd — the local worker agent, shared by the daemon binary and the
//! integration tests.

pub mod agent;

pub use agent::Agent;
