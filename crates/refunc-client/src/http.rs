//! Long-poll transport — a resolver bound to `POST {base}/{endpoint}/tasks`.
//!
//! The response body is a stream of frames. Connection failures are retried
//! with exponential backoff; a body severed mid-stream triggers a full
//! reconnect. Both count against the same attempt budget.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use refunc_core::config::RetryConfig;
use refunc_core::messages::{gen_id, response_action_bytes, MAX_TIMEOUT};
use refunc_core::InvokeRequest;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::context::{HttpTransport, InvocationContext};
use crate::error::TaskError;
use crate::resolver::{FrameSource, LineReader, TaskIo, TaskResolver};

pub const USER_AGENT: &str = "refunc-rs v1";
pub const USER_HEADER: &str = "X-Refunc-User";

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Reconnect budget of one long-poll call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// How long a cancelled call waits for its connection to wind down.
    pub close_timeout: Duration,
    /// Hard ceiling on one call regardless of deadline.
    pub max_invocation: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            initial_delay: Duration::from_millis(c.initial_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            close_timeout: Duration::from_millis(c.close_timeout_ms),
            max_invocation: Duration::from_secs(c.max_invocation_secs).min(MAX_TIMEOUT),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given delay: doubled, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }

    /// Sum of every backoff sleep when all attempts fail to connect.
    pub fn total_backoff(&self) -> Duration {
        let mut delay = self.initial_delay;
        let mut total = Duration::ZERO;
        for _ in 0..self.max_attempts {
            total += delay;
            delay = self.next_delay(delay);
        }
        total
    }
}

// ── Connector ─────────────────────────────────────────────────────────────────

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Issues one long-poll request and returns its body.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, user: &str, body: Bytes) -> Result<ByteStream, TaskError>;
}

/// `reqwest`-backed connector.
#[derive(Clone)]
pub struct ReqwestConnector {
    client: reqwest::Client,
}

impl Default for ReqwestConnector {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .tcp_keepalive(Duration::from_secs(15))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl ReqwestConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for ReqwestConnector {
    async fn connect(&self, url: &str, user: &str, body: Bytes) -> Result<ByteStream, TaskError> {
        let rsp = self
            .client
            .post(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .header(USER_HEADER, user)
            .body(body)
            .send()
            .await
            .map_err(|e| TaskError::Transport(e.to_string()))?;
        let stream = rsp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)) as ByteStream)
    }
}

// ── Task reader ───────────────────────────────────────────────────────────────

/// Frame source fed by a background poll loop.
pub struct TaskReader {
    rx: mpsc::Receiver<Result<Bytes, TaskError>>,
    _stop: DropGuard,
}

#[async_trait]
impl FrameSource for TaskReader {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TaskError> {
        match self.rx.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct PollRequest {
    connector: Arc<dyn Connector>,
    url: String,
    user: String,
    body: Bytes,
    policy: RetryPolicy,
}

impl TaskReader {
    /// Start polling. The loop stops when the reader is dropped or `deadline`
    /// (capped at the policy's hard ceiling) passes.
    fn spawn(req: PollRequest, deadline: Option<Instant>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let ceiling = Instant::now() + req.policy.max_invocation;
        let hard_deadline = deadline.map_or(ceiling, |d| d.min(ceiling));
        tokio::spawn(poll_loop(req, tx, stop.clone(), hard_deadline));
        Self {
            rx,
            _stop: stop.drop_guard(),
        }
    }
}

enum Bump {
    Eof,
    Severed(TaskError),
    Fatal(TaskError),
    Stopped,
}

async fn poll_loop(
    req: PollRequest,
    tx: mpsc::Sender<Result<Bytes, TaskError>>,
    stop: CancellationToken,
    hard_deadline: Instant,
) {
    let mut delay = req.policy.initial_delay;
    let mut last_err = None;

    for attempt in 1..=req.policy.max_attempts {
        let connected = tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep_until(hard_deadline) => {
                let _ = tx.send(Err(TaskError::DeadlineExceeded)).await;
                return;
            }
            r = req.connector.connect(&req.url, &req.user, req.body.clone()) => r,
        };

        let body = match connected {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(url = %req.url, attempt, error = %e, ?delay, "connect failed, backing off");
                last_err = Some(e);
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep_until(hard_deadline) => {
                        let _ = tx.send(Err(TaskError::DeadlineExceeded)).await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = req.policy.next_delay(delay);
                continue;
            }
        };

        match pump(body, &tx, &stop, hard_deadline, req.policy.close_timeout).await {
            Bump::Eof | Bump::Stopped => return,
            Bump::Fatal(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
            Bump::Severed(e) => {
                tracing::info!(url = %req.url, attempt, error = %e, "retry on error");
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| TaskError::Transport("retry budget exhausted".into()));
    let _ = tx.send(Err(err)).await;
}

/// Copy lines from one connection into `tx` until EOF, failure, or stop.
async fn pump(
    body: ByteStream,
    tx: &mpsc::Sender<Result<Bytes, TaskError>>,
    stop: &CancellationToken,
    hard_deadline: Instant,
    close_timeout: Duration,
) -> Bump {
    let conn = stop.child_token();
    let mut bumper = tokio::spawn(bump_lines(LineReader::new(body), tx.clone(), conn.clone()));

    let expired = tokio::select! {
        joined = &mut bumper => {
            return match joined {
                Ok(outcome) => outcome,
                Err(e) => Bump::Fatal(TaskError::Transport(format!("reader task failed, {}", e))),
            };
        }
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep_until(hard_deadline) => true,
    };

    conn.cancel();
    if tokio::time::timeout(close_timeout, &mut bumper).await.is_err() {
        bumper.abort();
        tracing::warn!(?close_timeout, "connection did not close in time");
        return Bump::Fatal(TaskError::CloseTimeout);
    }
    if expired {
        Bump::Fatal(TaskError::DeadlineExceeded)
    } else {
        Bump::Stopped
    }
}

async fn bump_lines(
    mut lines: LineReader<ByteStream>,
    tx: mpsc::Sender<Result<Bytes, TaskError>>,
    conn: CancellationToken,
) -> Bump {
    let mut first = true;
    loop {
        let frame = tokio::select! {
            _ = conn.cancelled() => return Bump::Stopped,
            frame = lines.next_frame() => frame,
        };
        let mut line = match frame {
            Ok(Some(line)) => line,
            Ok(None) => return Bump::Eof,
            Err(e @ TaskError::Transport(_)) => return Bump::Severed(e),
            Err(e) => return Bump::Fatal(e),
        };
        if std::mem::take(&mut first) {
            if let Some(frame) = legacy_response(&line) {
                line = frame;
            }
        }
        tokio::select! {
            _ = conn.cancelled() => return Bump::Stopped,
            sent = tx.send(Ok(line)) => {
                if sent.is_err() {
                    return Bump::Stopped;
                }
            }
        }
    }
}

/// Older gateways answer with the bare result instead of frames: a body whose
/// first line is JSON but not an envelope is wrapped as the `rsp` frame.
fn legacy_response(line: &[u8]) -> Option<Bytes> {
    let value: serde_json::Value = serde_json::from_slice(line).ok()?;
    if value.get("a").is_some() {
        return None;
    }
    Some(response_action_bytes(line))
}

// ── Resolver ──────────────────────────────────────────────────────────────────

/// Start a long-poll resolver for `endpoint`.
pub fn new_http_resolver(
    ctx: &InvocationContext,
    endpoint: &str,
    mut request: InvokeRequest,
) -> Result<TaskResolver, TaskError> {
    let transport: HttpTransport = ctx
        .http()
        .filter(|h| !h.base_url.is_empty())
        .cloned()
        .ok_or_else(|| TaskError::Config("base URL is not set".into()))?;

    let endpoint = endpoint.trim_matches('/');
    let mut url = format!("{}/{}/tasks", transport.base_url, endpoint);
    if ctx.is_logging_enabled() {
        url.push_str("?recv_log=true");
    }

    ctx.set_request_deadline(&mut request);
    let ctx = match request.deadline {
        Some(deadline) => ctx.clone().with_deadline(crate::context::instant_for(deadline)),
        None => ctx.clone(),
    };

    let body = Bytes::from(serde_json::to_vec(&request)?);
    let id = gen_id(&[endpoint.as_bytes(), &body]);
    let name = format!("{}<r{}>", endpoint, &id[7..14]);
    let tr = TaskResolver::new(id, name);

    if ctx.is_logging_enabled() {
        let mut logs = tr.log_observer();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(line) = logs.next().await {
                tracing::info!(endpoint = %endpoint, "[{}] {}", endpoint, line);
            }
        });
    }

    tracing::debug!(url = %url, "request");
    let poll = PollRequest {
        connector: transport.connector.clone(),
        url,
        user: ctx.user().to_string(),
        body,
        policy: transport.retry.clone(),
    };
    let deadline = ctx.deadline();
    tr.start(&ctx, async move {
        let reader = TaskReader::spawn(poll, deadline);
        Ok(TaskIo {
            input: Some(Box::new(reader)),
            output: None,
        })
    });
    Ok(tr)
}
