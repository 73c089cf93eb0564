//! Invocation broker — turns a call on a public endpoint into a forward to
//! a live instance, waking the instance first when it has no backends.
//!
//! Per inbound call: resolve (builtins bypass the rest), forward directly
//! when the instance is active, otherwise wait on the instance's wake record
//! while polling its status, then forward. Every failure is answered with an
//! `err` frame on the caller's reply subject.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use refunc_client::{BusError, BusMessage, MessageBus, Subscription, TaskError};
use refunc_core::config::BrokerConfig;
use refunc_core::messages::{encode, error_action_bytes, DEFAULT_JOB_TIMEOUT};
use refunc_core::model::{FuncDef, Trigger};
use refunc_core::subjects::{
    cry_wildcard, meta_wildcard, parse_instance_key, request_wildcard, split_topic, tap_wildcard,
    TAP_PREFIX,
};
use refunc_core::{Action, ErrorMessage, InvokeRequest, WireError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::builtins::Builtins;
use crate::operator::{Operator, ResolveError};
use crate::wake::WakeSignals;

const REQUEST_QUEUE: &str = "_req_";
const TAP_QUEUE: &str = "_tap_";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("invalid request, {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("json error, {0}")]
    Json(#[from] serde_json::Error),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{0}")]
    Unavailable(String),
    #[error("broker stopped")]
    Stopped,
    #[error("builtins: func {0} not found")]
    BuiltinNotFound(String),
    #[error("{0}")]
    Remote(ErrorMessage),
    #[error("panic, {0}")]
    Panic(String),
}

impl BrokerError {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Resolve(_) => "ResolveError",
            BrokerError::InvalidRequest(_) => "InvalidRequest",
            BrokerError::Wire(_) => "Protocol",
            BrokerError::Bus(_) => "Transport",
            BrokerError::Json(_) => "Protocol",
            BrokerError::DeadlineExceeded => "DeadlineExceeded",
            BrokerError::Unavailable(_) => "Unavailable",
            BrokerError::Stopped => "Stopped",
            BrokerError::BuiltinNotFound(_) => "NotFound",
            BrokerError::Remote(_) => "Remote",
            BrokerError::Panic(_) => "Panic",
        }
    }

    pub fn to_error_message(&self) -> ErrorMessage {
        match self {
            BrokerError::Remote(msg) => msg.clone(),
            other => ErrorMessage::new(other.kind(), other.to_string()),
        }
    }
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    operator: Arc<dyn Operator>,
    builtins: Builtins,
    wake: WakeSignals,
    config: BrokerConfig,
    stop: CancellationToken,
}

/// The broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Subscriptions {
    requests: Subscription,
    metas: Subscription,
    cries: Subscription,
    taps: Subscription,
}

impl Broker {
    pub fn new(bus: Arc<dyn MessageBus>, operator: Arc<dyn Operator>, config: BrokerConfig) -> Self {
        Self::with_builtins(bus, operator, config, Builtins::default())
    }

    pub fn with_builtins(
        bus: Arc<dyn MessageBus>,
        operator: Arc<dyn Operator>,
        config: BrokerConfig,
        builtins: Builtins,
    ) -> Self {
        let wake = WakeSignals::new(config.poke_interval());
        Self {
            inner: Arc::new(Inner {
                bus,
                operator,
                builtins,
                wake,
                config,
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn builtins(&self) -> &Builtins {
        &self.inner.builtins
    }

    pub fn wake_signals(&self) -> &WakeSignals {
        &self.inner.wake
    }

    /// Subscribe and serve until `shutdown` fires.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<(), BrokerError> {
        let subs = self.subscribe().await?;
        self.serve(subs, shutdown).await;
        Ok(())
    }

    /// Subscribe, then serve in the background. Subscriptions are live when
    /// this returns.
    pub async fn spawn(self, shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>, BrokerError> {
        let subs = self.subscribe().await?;
        Ok(tokio::spawn(self.serve(subs, shutdown)))
    }

    async fn subscribe(&self) -> Result<Subscriptions, BrokerError> {
        let bus = &self.inner.bus;
        let ns = self.inner.operator.namespace();
        let subs = Subscriptions {
            requests: bus.subscribe(&request_wildcard(ns), Some(REQUEST_QUEUE)).await?,
            metas: bus.subscribe(&meta_wildcard(ns), Some(REQUEST_QUEUE)).await?,
            cries: bus.subscribe(&cry_wildcard(), None).await?,
            taps: bus.subscribe(&tap_wildcard(), Some(TAP_QUEUE)).await?,
        };
        tracing::info!(namespace = %ns, "broker subscribed");
        Ok(subs)
    }

    async fn serve(self, mut subs: Subscriptions, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("broker shutting down");
                    break;
                }
                Some(msg) = subs.requests.next() => self.dispatch(msg),
                Some(msg) = subs.metas.next() => self.dispatch(msg),
                Some(msg) = subs.cries.next() => self.on_cry(&msg),
                Some(msg) = subs.taps.next() => self.on_tap(&msg),
                else => break,
            }
        }
        self.inner.stop.cancel();
    }

    fn dispatch(&self, msg: BusMessage) {
        let this = self.clone();
        tokio::spawn(async move {
            let subject = msg.subject.clone();
            let reply = msg.reply.clone();
            let handled = AssertUnwindSafe(this.on_request(msg)).catch_unwind().await;
            if let Err(panic) = handled {
                let err = TaskError::from_panic(panic);
                if let TaskError::Panic { message, backtrace } = &err {
                    tracing::error!(subject = %subject, %message, %backtrace, "request handler panicked");
                    if let Some(reply) = reply {
                        this.reply_error(&subject, &reply, &BrokerError::Panic(message.clone()))
                            .await;
                    }
                }
            }
        });
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Handle one inbound call or metadata query.
    pub async fn on_request(&self, msg: BusMessage) {
        let Some(reply) = msg.reply.clone() else {
            tracing::debug!(subject = %msg.subject, "dropping message without reply address");
            return;
        };
        tracing::trace!(subject = %msg.subject, "new request");

        let topic = match split_topic(&msg.subject) {
            Ok(t) => t,
            Err(e) => return self.reply_error(&msg.subject, &reply, &e.into()).await,
        };

        if topic.is_builtin() {
            match self.inner.builtins.handle(&topic.name, &msg.payload) {
                Ok(frame) => self.publish_reply(&msg.subject, &reply, frame).await,
                Err(e) => self.reply_error(&msg.subject, &reply, &e).await,
            }
            return;
        }

        let resolved = async {
            let trigger = self.inner.operator.trigger_for_endpoint(&topic.endpoint()).await?;
            let fndef = self.inner.operator.resolve_funcdef(&trigger).await?;
            Ok::<_, BrokerError>((trigger, fndef))
        }
        .await;
        let (trigger, fndef) = match resolved {
            Ok(r) => r,
            Err(e) => return self.reply_error(&msg.subject, &reply, &e).await,
        };

        if topic.is_meta() {
            self.reply_meta(&reply, &fndef).await;
            return;
        }
        if let Err(e) = self.forward_request(&msg, &reply, &fndef, &trigger).await {
            self.reply_error(&msg.subject, &reply, &e).await;
        }
    }

    async fn forward_request(
        &self,
        msg: &BusMessage,
        reply: &str,
        fndef: &FuncDef,
        trigger: &Trigger,
    ) -> Result<(), BrokerError> {
        let started = Instant::now();
        let operator = &self.inner.operator;
        let instance = operator.get_func_instance(trigger).await?;

        let timeout = if fndef.timeout_secs > 0 {
            Duration::from_secs(fndef.timeout_secs) + self.inner.config.launch_bias()
        } else {
            DEFAULT_JOB_TIMEOUT
        };

        let mut request: InvokeRequest = serde_json::from_slice(&msg.payload)?;
        let limit = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let cold = instance.status.active == 0;
        let deadline = match request.deadline {
            Some(d) if d <= limit => d,
            // An unset deadline is enforced; an over-long one is cut on a
            // cold start so the wait is bounded by the function's timeout.
            Some(d) if !cold => d,
            _ => limit,
        };
        let payload = if request.deadline == Some(deadline) {
            msg.payload.clone()
        } else {
            request.deadline = Some(deadline);
            Bytes::from(serde_json::to_vec(&request)?)
        };
        let wait_until = refunc_client::context::instant_for(deadline);

        let service = instance.service_endpoint();
        if !cold {
            tracing::trace!(instance = %instance.name, "forwarding request");
            return self.forward(&service, reply, payload, started).await;
        }

        tracing::debug!(instance = %instance.name, "forward request when online");
        let bus = self.inner.bus.clone();
        let cry_service = instance.cry_service_endpoint();
        let wake = self.inner.wake.join(&instance.crying_endpoint(), move || {
            let bus = bus.clone();
            let subject = cry_service.clone();
            async move {
                if let Err(e) = bus.publish(&subject, None, Bytes::new()).await {
                    tracing::trace!(subject = %subject, error = %e, "poke not delivered");
                }
            }
        });

        let poll = self.inner.config.status_poll();
        let mut status_tick = interval_at(Instant::now() + poll, poll);
        loop {
            tokio::select! {
                _ = wake.online() => {
                    drop(wake);
                    return self.forward(&service, reply, payload, started).await;
                }
                _ = tokio::time::sleep_until(wait_until) => return Err(BrokerError::DeadlineExceeded),
                _ = self.inner.stop.cancelled() => return Err(BrokerError::Stopped),
                _ = status_tick.tick() => {
                    let current = operator.get_func_instance(trigger).await?;
                    if let Some(reason) = current.status.terminal_failure() {
                        tracing::info!(instance = %current.name, %reason, "giving up on cold start");
                        return Err(BrokerError::Unavailable(reason));
                    }
                }
            }
        }
    }

    async fn forward(&self, service: &str, reply: &str, payload: Bytes, started: Instant) -> Result<(), BrokerError> {
        self.inner.bus.publish(service, Some(reply), payload).await?;
        let took = started.elapsed();
        if took > self.inner.config.slow_forward() {
            tracing::warn!(service = %service, ?took, "forwarded one slow request");
        }
        Ok(())
    }

    // ── Replies ───────────────────────────────────────────────────────────────

    async fn reply_meta(&self, reply: &str, fndef: &FuncDef) {
        let meta = serde_json::json!({
            "namespace": fndef.namespace,
            "name": fndef.name,
            "timeout": fndef.timeout_secs,
        });
        let subject = refunc_core::subjects::meta_subject(&fndef.endpoint());
        match Action::response(&meta).and_then(|a| encode(&a)) {
            Ok(frame) => self.publish_reply(&subject, reply, frame).await,
            Err(e) => self.reply_error(&subject, reply, &e.into()).await,
        }
    }

    async fn reply_error(&self, from: &str, reply: &str, err: &BrokerError) {
        tracing::debug!(subject = %from, error = %err, "replying with error");
        self.publish_reply(from, reply, error_action_bytes(&err.to_error_message()))
            .await;
    }

    async fn publish_reply(&self, from: &str, reply: &str, frame: Bytes) {
        if let Err(e) = self.inner.bus.publish(reply, None, frame).await {
            tracing::warn!(subject = %from, error = %e, "failed to reply");
        }
    }

    // ── Cry / tap ─────────────────────────────────────────────────────────────

    fn on_cry(&self, msg: &BusMessage) {
        if self.inner.wake.announce(&msg.subject) {
            tracing::debug!(subject = %msg.subject, "instance online");
        }
    }

    fn on_tap(&self, msg: &BusMessage) {
        match parse_instance_key(&msg.subject, TAP_PREFIX) {
            Ok((ns, name)) => self.inner.operator.tap(&format!("{}/{}", ns, name)),
            Err(_) => tracing::error!(subject = %msg.subject, "malformed tap message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalOperator;
    use refunc_client::bus::LocalBus;
    use refunc_core::messages::response_action_bytes;
    use refunc_core::model::{Condition, ConditionStatus, ConditionType, REASON_XENV_NOT_RESOLVED};
    use refunc_core::subjects::invoke_subject;
    use refunc_core::InvokeResponse;

    struct Fixture {
        bus: LocalBus,
        operator: LocalOperator,
        broker: Broker,
        _shutdown: broadcast::Sender<()>,
    }

    async fn fixture(timeout_secs: u64) -> Fixture {
        let bus = LocalBus::new();
        let operator = LocalOperator::new("");
        operator.register(FuncDef {
            namespace: "ns".into(),
            name: "fn".into(),
            timeout_secs,
        });
        let broker = Broker::new(
            Arc::new(bus.clone()),
            Arc::new(operator.clone()),
            BrokerConfig::default(),
        );
        let (tx, rx) = broadcast::channel(1);
        broker.clone().spawn(rx).await.unwrap();
        Fixture {
            bus,
            operator,
            broker,
            _shutdown: tx,
        }
    }

    async fn call(bus: &LocalBus, endpoint: &str, deadline: Duration) -> Result<Bytes, BusError> {
        let req = InvokeRequest::default();
        let msg = bus
            .request(
                &invoke_subject(endpoint),
                Bytes::from(serde_json::to_vec(&req).unwrap()),
                Instant::now() + deadline,
            )
            .await?;
        Ok(msg.payload)
    }

    fn frame_kind(frame: &[u8]) -> Action {
        serde_json::from_slice(refunc_core::messages::trim_crlf(frame)).unwrap()
    }

    /// Answers every request on the instance subject with `ok`.
    async fn serve_instance(bus: &LocalBus, subject: &str) {
        let mut sub = bus.subscribe(subject, None).await.unwrap();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(reply) = msg.reply else { continue };
                let _ = bus.publish(&reply, None, response_action_bytes(b"\"ok\"")).await;
            }
        });
    }

    #[tokio::test]
    async fn warm_instance_is_forwarded_directly() {
        let f = fixture(0).await;
        f.operator.set_active("ns/fn", 1);
        serve_instance(&f.bus, "_refunc._insts_.ns.fn").await;

        let out = call(&f.bus, "ns/fn", Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame_kind(&out).kind, refunc_core::ActionType::Response);
        assert_eq!(f.broker.wake_signals().loops_started(), 0);
    }

    #[tokio::test]
    async fn cold_instance_is_forwarded_after_cry() {
        let f = fixture(0).await;
        serve_instance(&f.bus, "_refunc._insts_.ns.fn").await;

        let mut pokes = f.bus.subscribe("_refunc._insts_.ns.fn._cry_", None).await.unwrap();
        let bus = f.bus.clone();
        tokio::spawn(async move {
            pokes.next().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            bus.publish("_refunc._cry_.ns/fn", None, Bytes::new()).await.unwrap();
        });

        let out = call(&f.bus, "ns/fn", Duration::from_secs(5)).await.unwrap();
        let rsp: InvokeResponse = serde_json::from_slice(frame_kind(&out).payload_bytes()).unwrap();
        assert_eq!(rsp.payload.unwrap().get(), "\"ok\"");
        assert_eq!(f.broker.wake_signals().loops_started(), 1);
        assert!(f.broker.wake_signals().is_empty());
    }

    #[tokio::test]
    async fn cold_wait_respects_request_deadline() {
        let f = fixture(0).await;
        let req = InvokeRequest {
            deadline: Some(Utc::now() + chrono::Duration::milliseconds(100)),
            ..Default::default()
        };
        let msg = f
            .bus
            .request(
                &invoke_subject("ns/fn"),
                Bytes::from(serde_json::to_vec(&req).unwrap()),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        let err: ErrorMessage = serde_json::from_slice(frame_kind(&msg.payload).payload_bytes()).unwrap();
        assert_eq!(err.error_type, "DeadlineExceeded");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.broker.wake_signals().is_empty(), "wake record cleaned up");
    }

    #[tokio::test]
    async fn terminal_status_aborts_cold_wait() {
        let f = fixture(0).await;
        f.operator.set_conditions(
            "ns/fn",
            vec![Condition::new(ConditionType::Pending, ConditionStatus::True, REASON_XENV_NOT_RESOLVED)],
        );
        let out = call(&f.bus, "ns/fn", Duration::from_secs(5)).await.unwrap();
        let err: ErrorMessage = serde_json::from_slice(frame_kind(&out).payload_bytes()).unwrap();
        assert_eq!(err.error_type, "Unavailable");
        assert!(err.message.contains(REASON_XENV_NOT_RESOLVED));
    }

    #[tokio::test]
    async fn unknown_endpoint_gets_error_frame() {
        let f = fixture(0).await;
        let out = call(&f.bus, "ns/missing", Duration::from_secs(5)).await.unwrap();
        let action = frame_kind(&out);
        assert_eq!(action.kind, refunc_core::ActionType::Error);
        let err: ErrorMessage = serde_json::from_slice(action.payload_bytes()).unwrap();
        assert!(err.message.contains("ns/missing"));
    }

    #[tokio::test]
    async fn builtins_and_meta_are_answered_locally() {
        let f = fixture(30).await;
        let out = call(&f.bus, "builtins/helloworld", Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame_kind(&out).kind, refunc_core::ActionType::Response);

        let msg = f
            .bus
            .request("refunc.ns.fn._meta", Bytes::from_static(b"{}"), Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        let rsp: InvokeResponse = serde_json::from_slice(frame_kind(&msg.payload).payload_bytes()).unwrap();
        let meta: serde_json::Value = serde_json::from_str(rsp.payload.unwrap().get()).unwrap();
        assert_eq!(meta["timeout"], 30);
    }

    #[tokio::test]
    async fn taps_reach_the_operator() {
        let f = fixture(0).await;
        f.bus.publish("_refunc._tap_.ns/fn", None, Bytes::new()).await.unwrap();
        f.bus.publish("_refunc._tap_.malformed", None, Bytes::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.operator.tap_count("ns/fn"), 1);
    }

    #[test]
    fn deadline_errors_are_recognised_by_clients() {
        let msg = BrokerError::DeadlineExceeded.to_error_message();
        assert!(TaskError::Remote(msg).is_deadline());
    }
}
