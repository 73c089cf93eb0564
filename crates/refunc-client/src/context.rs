//! Per-call invocation context.
//!
//! Carries the deadline, timeout hint, log forwarding flag, tracing span,
//! cancellation token and transport handles down the call chain explicitly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use refunc_core::config::ClientConfig;
use refunc_core::messages::DEFAULT_JOB_TIMEOUT;
use refunc_core::InvokeRequest;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::http::{Connector, ReqwestConnector, RetryPolicy};

/// Shortest timeout hint honoured.
pub const MIN_TIMEOUT_HINT: Duration = Duration::from_millis(500);

/// Long-poll transport settings.
#[derive(Clone)]
pub struct HttpTransport {
    pub base_url: String,
    pub connector: Arc<dyn Connector>,
    pub retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connector: Arc::new(ReqwestConnector::default()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Clone)]
pub struct InvocationContext {
    deadline: Option<Instant>,
    timeout_hint: Option<Duration>,
    log_forwarding: bool,
    user: String,
    span: tracing::Span,
    cancel: CancellationToken,
    bus: Option<Arc<dyn MessageBus>>,
    http: Option<HttpTransport>,
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationContext {
    pub fn new() -> Self {
        Self {
            deadline: None,
            timeout_hint: None,
            log_forwarding: false,
            user: String::new(),
            span: tracing::Span::current(),
            cancel: CancellationToken::new(),
            bus: None,
            http: None,
        }
    }

    /// Context for the long-poll transport described by the client config.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut ctx = Self::new().with_logging(config.recv_log);
        if !config.base_url.is_empty() {
            ctx = ctx.with_http(
                HttpTransport::new(config.base_url.clone())
                    .with_retry(RetryPolicy::from(&config.retry)),
            );
        }
        ctx
    }

    // ── Builders ──────────────────────────────────────────────────────────────

    /// Set the deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Suggest a timeout. Clamped to the remaining deadline, floored at 500 ms.
    pub fn with_timeout_hint(mut self, hint: Duration) -> Self {
        let mut hint = hint;
        if let Some(remaining) = self.remaining() {
            hint = hint.min(remaining);
        }
        self.timeout_hint = Some(hint.max(MIN_TIMEOUT_HINT));
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.log_forwarding = enabled;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Tie this context to an outer cancellation token.
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_http(mut self, http: HttpTransport) -> Self {
        self.http = Some(http);
        self
    }

    /// Derived context whose cancellation does not reach the parent.
    pub fn child(&self) -> Self {
        let mut ctx = self.clone();
        ctx.cancel = self.cancel.child_token();
        ctx
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The hint in effect: the smaller of hint and remaining deadline.
    pub fn timeout_hint(&self) -> Option<Duration> {
        match (self.remaining(), self.timeout_hint) {
            (Some(r), Some(h)) => Some(r.min(h)),
            (r, h) => r.or(h),
        }
    }

    /// Instant at which work on behalf of this context must stop, if any.
    pub fn effective_deadline(&self) -> Option<Instant> {
        match (self.deadline, self.timeout_hint) {
            (Some(d), _) => Some(d),
            (None, Some(h)) => Some(Instant::now() + h),
            (None, None) => None,
        }
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.log_forwarding
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn bus(&self) -> Option<&Arc<dyn MessageBus>> {
        self.bus.as_ref()
    }

    pub fn http(&self) -> Option<&HttpTransport> {
        self.http.as_ref()
    }

    /// Fill in the request deadline: the request's own, else now + 9 min,
    /// shortened by the timeout hint when that hint exceeds 500 ms. The
    /// result never runs past this context's own deadline.
    pub fn set_request_deadline(&self, request: &mut InvokeRequest) {
        let now = Utc::now();
        let mut deadline = request
            .deadline
            .unwrap_or_else(|| now + to_chrono(DEFAULT_JOB_TIMEOUT));
        if let Some(hint) = self.timeout_hint {
            let hinted = now + to_chrono(hint);
            if hint > MIN_TIMEOUT_HINT && hinted < deadline {
                deadline = hinted;
            }
        }
        if let Some(remaining) = self.remaining() {
            deadline = deadline.min(now + to_chrono(remaining));
        }
        request.deadline = Some(deadline);
    }
}

/// Map a wall-clock deadline onto the runtime clock.
pub fn instant_for(deadline: DateTime<Utc>) -> Instant {
    let left = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + left
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
