//! refunc-client — task resolvers and the transports that drive them.
//!
//! A [`TaskResolver`] is one in-flight call. Three transports feed it:
//! a local worker process ([`pipe`]), a long-poll HTTP call ([`http`]), and a
//! request/reply exchange over a [`MessageBus`] ([`bus_resolver`]). The
//! [`LiveTaskStore`] deduplicates concurrent calls sharing a request id.

pub mod bus;
pub mod bus_resolver;
pub mod context;
pub mod error;
pub mod http;
pub mod invoke;
pub mod live_store;
pub mod parse;
pub mod pipe;
pub mod resolver;

pub use bus::{BusMessage, LocalBus, MessageBus, Subscription};
pub use bus_resolver::new_bus_resolver;
pub use context::{HttpTransport, InvocationContext};
pub use error::{BusError, TaskError};
pub use http::{new_http_resolver, Connector, ReqwestConnector, RetryPolicy};
pub use invoke::{invoke, new_task_resolver};
pub use live_store::LiveTaskStore;
pub use parse::{parse_action, TaskParser};
pub use pipe::{new_pipe_resolver, ChildProcess, Process, ProcessFactory, ProcessPool};
pub use resolver::{FrameSink, FrameSource, LineReader, LineWriter, TaskIo, TaskResolver};
