//! Worker agent — serves one function's instance subjects with local
//! worker processes.
//!
//! The agent answers pokes on the cry-service subject by marking the instance
//! active and announcing on the crying subject, so a waiting broker forwards
//! the call. Calls arriving on the private instance subject run on a pooled
//! process through the pipe transport; the terminal frame goes straight to
//! the caller's reply subject.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use refunc_broker::LocalOperator;
use refunc_client::{
    new_pipe_resolver, BusError, BusMessage, ChildProcess, InvocationContext, MessageBus, Process,
    ProcessFactory, ProcessPool, Subscription, TaskError,
};
use refunc_core::config::FunctionConfig;
use refunc_core::messages::{
    encode, error_action_bytes, response_action_bytes, DEFAULT_JOB_TIMEOUT, LOG_ENDPOINT_OPTION,
};
use refunc_core::model::{FuncDef, FuncInstance};
use refunc_core::{Action, InvokeRequest};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

const SERVICE_QUEUE: &str = "_svc_";
const TAP_EVERY: Duration = Duration::from_secs(2);
const BUSY_TAP_EVERY: Duration = Duration::from_secs(1);

pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    operator: LocalOperator,
    instance: FuncInstance,
    endpoint: String,
    timeout: Duration,
    spawn: ProcessFactory,
    pool: ProcessPool,
    tap_pending: AtomicBool,
}

struct Subscriptions {
    calls: Subscription,
    pokes: Subscription,
}

impl Agent {
    pub fn new(bus: Arc<dyn MessageBus>, operator: LocalOperator, function: &FunctionConfig) -> Self {
        let funcdef = FuncDef {
            namespace: function.namespace.clone(),
            name: function.name.clone(),
            timeout_secs: function.timeout_secs,
        };
        let endpoint = funcdef.endpoint();
        let instance = match operator.instance(&endpoint) {
            Some(instance) => instance,
            None => operator.register(funcdef),
        };
        let timeout = match function.timeout_secs {
            0 => DEFAULT_JOB_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        let (command, args) = (function.command.clone(), function.args.clone());
        let (ns, name) = (function.namespace.clone(), function.name.clone());
        let spawn: ProcessFactory = Arc::new(move || {
            Arc::new(
                ChildProcess::new(command.clone(), args.clone())
                    .env("REFUNC_NAMESPACE", ns.clone())
                    .env("REFUNC_NAME", name.clone()),
            ) as Arc<dyn Process>
        });

        Self {
            inner: Arc::new(Inner {
                bus,
                operator,
                instance,
                endpoint,
                timeout,
                spawn,
                pool: ProcessPool::new(),
                tap_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.inner.pool
    }

    /// Subscribe, announce, then serve in the background until `shutdown`
    /// fires. Subscriptions are live when this returns.
    pub async fn spawn(self, shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>, BusError> {
        let inner = &self.inner;
        let subs = Subscriptions {
            calls: inner
                .bus
                .subscribe(&inner.instance.service_endpoint(), Some(SERVICE_QUEUE))
                .await?,
            pokes: inner
                .bus
                .subscribe(&inner.instance.cry_service_endpoint(), Some(SERVICE_QUEUE))
                .await?,
        };
        if let Err(e) = inner.bus.publish(&inner.instance.crying_endpoint(), None, Bytes::new()).await {
            tracing::error!(endpoint = %inner.endpoint, error = %e, "failed to send cry");
        }
        tracing::info!(endpoint = %inner.endpoint, "agent started");
        Ok(tokio::spawn(self.serve(subs, shutdown)))
    }

    async fn serve(self, mut subs: Subscriptions, mut shutdown: broadcast::Receiver<()>) {
        let mut taps = interval_at(Instant::now() + TAP_EVERY, TAP_EVERY);
        taps.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(msg) = subs.calls.next() => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move { inner.on_call(msg).await });
                }
                Some(msg) = subs.pokes.next() => self.inner.on_poke(msg).await,
                _ = taps.tick() => self.inner.flush_tap().await,
                else => break,
            }
        }
        tracing::info!(endpoint = %self.inner.endpoint, "agent stopping");
        self.inner.operator.set_active(&self.inner.endpoint, 0);
        self.inner.pool.shutdown().await;
    }
}

impl Inner {
    async fn on_poke(&self, msg: BusMessage) {
        self.operator.set_active(&self.endpoint, 1);
        let target = msg.reply.unwrap_or_else(|| self.instance.crying_endpoint());
        if let Err(e) = self.bus.publish(&target, None, Bytes::new()).await {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "failed to answer poke");
        }
    }

    fn tap(&self) {
        self.tap_pending.store(true, Ordering::Relaxed);
    }

    /// Send at most one tap for everything recorded since the last flush.
    async fn flush_tap(&self) {
        if !self.tap_pending.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.bus.publish(&self.instance.tapping_endpoint(), None, Bytes::new()).await {
            tracing::error!(endpoint = %self.endpoint, error = %e, "tap failed");
        }
    }

    async fn on_call(&self, msg: BusMessage) {
        let Some(reply) = msg.reply else {
            tracing::error!(endpoint = %self.endpoint, "got invalid request, empty reply");
            return;
        };
        let request: InvokeRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(e) => return self.reply_error(&reply, &e.into()).await,
        };

        self.tap();
        let mut ctx = InvocationContext::new().with_timeout_hint(self.timeout);
        if let Some(deadline) = request.deadline {
            ctx = ctx.with_deadline(refunc_client::context::instant_for(deadline));
        }
        let tr = match new_pipe_resolver(&ctx, &self.endpoint, &request, &self.pool, self.spawn.clone()) {
            Ok(tr) => tr,
            Err(e) => return self.reply_error(&reply, &e).await,
        };

        let log_target = request
            .options
            .get(LOG_ENDPOINT_OPTION)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut logs = Some(tr.log_observer());
        let mut busy = interval(BUSY_TAP_EVERY);
        busy.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                line = next_line(&mut logs) => match line {
                    Some(line) => self.on_log(log_target.as_deref(), &line).await,
                    None => logs = None,
                },
                _ = tr.done() => break,
                _ = busy.tick() => self.tap(),
            }
        }
        if let Some(mut observer) = logs {
            for line in observer.drain() {
                self.on_log(log_target.as_deref(), &line).await;
            }
        }

        let frame = match tr.result() {
            Some(Ok(data)) => {
                self.tap();
                response_action_bytes(&data)
            }
            Some(Err(e)) => error_action_bytes(&e.to_error_message()),
            None => error_action_bytes(&TaskError::Stopped.to_error_message()),
        };
        if let Err(e) = self.bus.publish(&reply, None, frame).await {
            tracing::error!(task = %tr.name(), reply = %reply, error = %e, "failed to publish result");
        }
    }

    async fn on_log(&self, target: Option<&str>, line: &str) {
        if line.contains("] done in") {
            return;
        }
        let Some(target) = target else {
            tracing::debug!(endpoint = %self.endpoint, "{}", line);
            return;
        };
        let prefixed = format!("{}{}", self.log_prefix(), line);
        let frame = match Action::log(&prefixed).and_then(|a| encode(&a)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "unencodable log line");
                return;
            }
        };
        if let Err(e) = self.bus.publish(target, None, frame).await {
            tracing::error!(endpoint = %self.endpoint, error = %e, "logging failed: {:?}", line);
        }
    }

    fn log_prefix(&self) -> String {
        format!(
            "{} {}/{}] ",
            Utc::now().format("%m%dT%H:%M:%S%.3fZ"),
            self.instance.namespace,
            self.instance.name
        )
    }

    async fn reply_error(&self, reply: &str, err: &TaskError) {
        tracing::debug!(endpoint = %self.endpoint, error = %err, "request on error");
        if let Err(e) = self.bus.publish(reply, None, error_action_bytes(&err.to_error_message())).await {
            tracing::error!(reply = %reply, error = %e, "failed to reply error");
        }
    }
}

async fn next_line(logs: &mut Option<refunc_core::Observer<String>>) -> Option<String> {
    match logs {
        Some(observer) => observer.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refunc_client::LocalBus;
    use refunc_core::messages::trim_crlf;
    use refunc_core::subjects::TAP_PREFIX;
    use refunc_core::{ActionType, ErrorMessage, InvokeResponse};

    const ECHO_WORKER: &str = r#"while IFS= read -r line; do echo "handling" >&2; printf '{"a":"rsp","p":{"payload":{"echo":true}}}\r\n'; done"#;
    const FAILING_WORKER: &str = r#"while IFS= read -r line; do printf '{"a":"err","p":{"errorMessage":"boom","errorType":"RuntimeError"}}\r\n'; done"#;

    fn function(script: &str) -> FunctionConfig {
        FunctionConfig {
            namespace: "default".into(),
            name: "echo".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout_secs: 5,
        }
    }

    async fn start(bus: &LocalBus, script: &str) -> (LocalOperator, Agent, broadcast::Sender<()>, JoinHandle<()>) {
        let operator = LocalOperator::new("");
        let agent = Agent::new(Arc::new(bus.clone()), operator.clone(), &function(script));
        let probe = Agent {
            inner: agent.inner.clone(),
        };
        let (tx, rx) = broadcast::channel(1);
        let handle = agent.spawn(rx).await.unwrap();
        (operator, probe, tx, handle)
    }

    async fn call(bus: &LocalBus, request: &InvokeRequest) -> Action {
        let msg = bus
            .request(
                "_refunc._insts_.default.echo",
                Bytes::from(serde_json::to_vec(request).unwrap()),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        serde_json::from_slice(trim_crlf(&msg.payload)).unwrap()
    }

    #[tokio::test]
    async fn poke_activates_and_announces() {
        let bus = LocalBus::new();
        let mut cries = bus.subscribe("_refunc._cry_.default/echo", None).await.unwrap();
        let (operator, _agent, _tx, _handle) = start(&bus, ECHO_WORKER).await;
        cries.next().await.unwrap();
        assert_eq!(operator.instance("default/echo").unwrap().status.active, 0);

        bus.publish("_refunc._insts_.default.echo._cry_", None, Bytes::new()).await.unwrap();
        cries.next().await.unwrap();
        assert_eq!(operator.instance("default/echo").unwrap().status.active, 1);
    }

    #[tokio::test]
    async fn call_runs_on_a_pooled_process() {
        let bus = LocalBus::new();
        let (_operator, agent, _tx, _handle) = start(&bus, ECHO_WORKER).await;

        for _ in 0..2 {
            let frame = call(&bus, &InvokeRequest::default()).await;
            assert_eq!(frame.kind, ActionType::Response);
            let rsp: InvokeResponse = serde_json::from_slice(frame.payload_bytes()).unwrap();
            assert_eq!(rsp.payload.unwrap().get(), r#"{"echo":true}"#);
        }
        assert_eq!(agent.pool().idle_count("default/echo"), 1);
    }

    #[tokio::test]
    async fn worker_error_is_replied_and_process_dropped() {
        let bus = LocalBus::new();
        let (_operator, agent, _tx, _handle) = start(&bus, FAILING_WORKER).await;

        let frame = call(&bus, &InvokeRequest::default()).await;
        assert_eq!(frame.kind, ActionType::Error);
        let err: ErrorMessage = serde_json::from_slice(frame.payload_bytes()).unwrap();
        assert_eq!(err.error_type, "RuntimeError");
        assert_eq!(agent.pool().idle_count("default/echo"), 0);
    }

    #[tokio::test]
    async fn stderr_is_forwarded_with_prefix() {
        let bus = LocalBus::new();
        let (_operator, _agent, _tx, _handle) = start(&bus, ECHO_WORKER).await;
        let mut logs = bus.subscribe("logs.here", None).await.unwrap();

        let mut request = InvokeRequest::default();
        request
            .options
            .insert(LOG_ENDPOINT_OPTION.into(), serde_json::Value::String("logs.here".into()));
        let frame = call(&bus, &request).await;
        assert_eq!(frame.kind, ActionType::Response);

        let msg = tokio::time::timeout(Duration::from_secs(1), logs.next())
            .await
            .unwrap()
            .unwrap();
        let log: Action = serde_json::from_slice(trim_crlf(&msg.payload)).unwrap();
        assert_eq!(log.kind, ActionType::Log);
        let line: String = serde_json::from_slice(log.payload_bytes()).unwrap();
        assert!(line.ends_with(" default/echo] handling"), "got {line}");
    }

    #[tokio::test]
    async fn busy_agent_taps() {
        let bus = LocalBus::new();
        let mut taps = bus.subscribe(&format!("{}>", TAP_PREFIX), None).await.unwrap();
        let (_operator, _agent, _tx, _handle) = start(&bus, ECHO_WORKER).await;

        call(&bus, &InvokeRequest::default()).await;
        let tap = tokio::time::timeout(TAP_EVERY * 2, taps.next()).await.unwrap().unwrap();
        assert_eq!(tap.subject, "_refunc._tap_.default/echo");
    }

    #[tokio::test]
    async fn shutdown_deactivates() {
        let bus = LocalBus::new();
        let (operator, _agent, tx, handle) = start(&bus, ECHO_WORKER).await;
        bus.publish("_refunc._insts_.default.echo._cry_", None, Bytes::new()).await.unwrap();
        call(&bus, &InvokeRequest::default()).await;
        assert_eq!(operator.instance("default/echo").unwrap().status.active, 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(operator.instance("default/echo").unwrap().status.active, 0);
    }
}
