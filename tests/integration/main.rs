//! refunc integration test harness.
//!
//! Every test builds its own in-process cluster: a `LocalBus`, the broker
//! over a `LocalOperator`, and on demand worker agents (running `sh` scripts
//! as worker processes), scripted fake instances, and the HTTP gateway on an
//! ephemeral port.
//!
//!   cargo test --test integration
//!
//! Worker scripts need a POSIX `sh` on the PATH.

mod dedup;
mod scenarios;
mod transports;
mod wake;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use refunc_broker::{Broker, LocalOperator};
use refunc_client::{HttpTransport, InvocationContext, LocalBus, MessageBus};
use refunc_core::config::{BrokerConfig, FunctionConfig};
use refunc_core::model::FuncDef;
use refunc_gateway::GatewayState;
use refuncd::Agent;
use tokio::sync::broadcast;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Namespace every test function lives in.
pub const NS: &str = "itest";

/// Answers each request with the request frame itself as the payload.
pub const ECHO_WORKER: &str = r#"while IFS= read -r line; do line=$(printf '%s' "$line" | tr -d '\r'); printf '{"a":"rsp","p":{"payload":%s}}\r\n' "$line"; done"#;

/// Logs to stderr before answering.
pub const CHATTY_WORKER: &str = r#"while IFS= read -r line; do echo "got request" >&2; sleep 0.2; printf '{"a":"rsp","p":{"payload":"logged"}}\r\n'; done"#;

/// Fails every request with an application error.
pub const FAILING_WORKER: &str = r#"while IFS= read -r line; do printf '{"a":"err","p":{"errorType":"ValueError","errorMessage":"bad input"}}\r\n'; done"#;

pub fn endpoint(name: &str) -> String {
    format!("{}/{}", NS, name)
}

/// How a scripted instance behaves.
pub struct FakeInstance {
    /// Delay between the first poke and the announcement.
    pub announce_after: Duration,
    /// Delay before answering a call.
    pub reply_after: Duration,
    /// Raw reply published to the caller.
    pub reply: Bytes,
}

impl FakeInstance {
    pub fn replying(reply: Bytes) -> Self {
        Self {
            announce_after: Duration::ZERO,
            reply_after: Duration::ZERO,
            reply,
        }
    }
}

pub struct Cluster {
    pub bus: LocalBus,
    pub operator: LocalOperator,
    pub broker: Broker,
    shutdown: broadcast::Sender<()>,
}

impl Cluster {
    pub async fn start() -> Result<Self> {
        let bus = LocalBus::new();
        let operator = LocalOperator::new("");
        let broker = Broker::new(
            Arc::new(bus.clone()),
            Arc::new(operator.clone()),
            BrokerConfig::default(),
        );
        let (shutdown, _) = broadcast::channel(1);
        broker
            .clone()
            .spawn(shutdown.subscribe())
            .await
            .context("broker failed to start")?;
        Ok(Self {
            bus,
            operator,
            broker,
            shutdown,
        })
    }

    /// Register a function with a scaled-to-zero instance and nothing behind it.
    pub fn register(&self, name: &str, timeout_secs: u64) {
        self.operator.register(FuncDef {
            namespace: NS.into(),
            name: name.into(),
            timeout_secs,
        });
    }

    /// Start a worker agent running `script` for function `name`.
    pub async fn agent(&self, name: &str, script: &str) -> Result<()> {
        let function = FunctionConfig {
            namespace: NS.into(),
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout_secs: 10,
        };
        Agent::new(Arc::new(self.bus.clone()), self.operator.clone(), &function)
            .spawn(self.shutdown.subscribe())
            .await
            .with_context(|| format!("agent for {} failed to start", name))?;
        Ok(())
    }

    /// Serve the instance of registered function `name` with a script;
    /// returns the number of calls it received.
    pub async fn fake_instance(&self, name: &str, fake: FakeInstance) -> Result<Arc<AtomicUsize>> {
        let ep = endpoint(name);
        let instance = self.operator.instance(&ep).context("function not registered")?;
        let mut pokes = self.bus.subscribe(&instance.cry_service_endpoint(), None).await?;
        let mut calls = self.bus.subscribe(&instance.service_endpoint(), None).await?;
        let received = Arc::new(AtomicUsize::new(0));

        let (bus, operator, counter) = (self.bus.clone(), self.operator.clone(), received.clone());
        tokio::spawn(async move {
            let mut announcing = false;
            loop {
                tokio::select! {
                    Some(_) = pokes.next() => {
                        if announcing {
                            continue;
                        }
                        announcing = true;
                        let (bus, operator, ep) = (bus.clone(), operator.clone(), ep.clone());
                        let crying = instance.crying_endpoint();
                        let delay = fake.announce_after;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            operator.set_active(&ep, 1);
                            let _ = bus.publish(&crying, None, Bytes::new()).await;
                        });
                    }
                    Some(msg) = calls.next() => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let Some(reply) = msg.reply else { continue };
                        let (bus, payload, delay) = (bus.clone(), fake.reply.clone(), fake.reply_after);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = bus.publish(&reply, None, payload).await;
                        });
                    }
                    else => break,
                }
            }
        });
        Ok(received)
    }

    /// Serve the gateway on an ephemeral port; returns its base URL.
    pub async fn gateway(&self) -> Result<String> {
        let state = GatewayState::new(self.bus_ctx());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, refunc_gateway::router(state)).await;
        });
        Ok(format!("http://{}", addr))
    }

    pub fn bus_ctx(&self) -> InvocationContext {
        InvocationContext::new().with_bus(Arc::new(self.bus.clone()) as Arc<dyn MessageBus>)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub fn http_ctx(base: &str) -> InvocationContext {
    InvocationContext::new().with_http(HttpTransport::new(base))
}
