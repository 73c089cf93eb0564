//! refunc-core — wire envelope, bus subjects, resource model, and configuration.
//! All other refunc crates depend on this one.

pub mod config;
pub mod messages;
pub mod model;
pub mod stream;
pub mod subjects;

pub use messages::{Action, ActionType, ErrorMessage, InvokeRequest, InvokeResponse, WireError};
pub use stream::{Broadcaster, Observer};
