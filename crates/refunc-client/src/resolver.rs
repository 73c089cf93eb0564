//! Generic task resolver — one in-flight call.
//!
//! A resolver drains an inbound frame source through `parse_action`, writes
//! outbound actions to an optional sink, and settles exactly once. Settlement
//! is first-writer-wins: later results are dropped silently. The done signal
//! fires after the `when_done` hook has run.
//!
//! Transports plug in through `FrameSource` / `FrameSink`; the parse and
//! settle logic lives only here.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use refunc_core::messages::{byte_size, encode, trim_crlf, MAX_PAYLOAD_SIZE, TOKEN_CRLF};
use refunc_core::{Action, Broadcaster, Observer};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::context::InvocationContext;
use crate::error::TaskError;
use crate::parse::{parse_action, TaskParser};

// ── Frame I/O ─────────────────────────────────────────────────────────────────

/// Inbound side of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame without its line terminator. `Ok(None)` at end of stream.
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TaskError>;
}

/// Outbound side of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame, CRLF-terminated, and flush.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TaskError>;
}

/// Line-delimited frame reader over any byte stream. Rejects lines larger
/// than `MAX_PAYLOAD_SIZE` and skips blank lines.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max: usize,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_PAYLOAD_SIZE)
    }

    pub fn with_limit(inner: R, max: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for LineReader<R> {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TaskError> {
        loop {
            // Partial reads stay in `buf`, so a cancelled call resumes cleanly.
            let budget = (self.max + TOKEN_CRLF.len()).saturating_sub(self.buf.len()) as u64;
            let n = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|e| TaskError::Transport(format!("scanner error, {}", e)))?;

            let complete = self.buf.last() == Some(&b'\n');
            if !complete {
                if n == 0 && self.buf.is_empty() {
                    return Ok(None);
                }
                if self.buf.len() > self.max {
                    self.buf.clear();
                    return Err(TaskError::Protocol(format!(
                        "frame exceeds {} bytes",
                        self.max
                    )));
                }
                if n == 0 {
                    // Unterminated final line.
                    let line = Bytes::copy_from_slice(&self.buf);
                    self.buf.clear();
                    return Ok(Some(line));
                }
                continue;
            }

            let line = Bytes::copy_from_slice(trim_crlf(&self.buf));
            self.buf.clear();
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }
}

/// CRLF-terminating, flushing frame writer.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for LineWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TaskError> {
        let io = |e: std::io::Error| TaskError::Transport(format!("write error, {}", e));
        self.inner.write_all(trim_crlf(frame)).await.map_err(io)?;
        self.inner.write_all(TOKEN_CRLF).await.map_err(io)?;
        self.inner.flush().await.map_err(io)
    }
}

#[async_trait]
impl<T: FrameSource + Send> FrameSource for OwnedMutexGuard<T> {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TaskError> {
        (**self).next_frame().await
    }
}

#[async_trait]
impl<T: FrameSink + Send> FrameSink for OwnedMutexGuard<T> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TaskError> {
        (**self).write_frame(frame).await
    }
}

/// Streams a resolver talks to. Produced by a transport's factory.
#[derive(Default)]
pub struct TaskIo {
    pub input: Option<Box<dyn FrameSource>>,
    pub output: Option<Box<dyn FrameSink>>,
}

// ── Resolver ──────────────────────────────────────────────────────────────────

type DoneHook = Box<dyn FnOnce(&Result<Bytes, TaskError>) + Send>;

struct Inner {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    started: std::time::Instant,

    result: OnceLock<Result<Bytes, TaskError>>,
    when_done: Mutex<Option<DoneHook>>,
    done: CancellationToken,

    logs: Broadcaster<String>,
    msgs: Broadcaster<Bytes>,

    emitted: AtomicU64,
    published: AtomicU64,
    payload_size: AtomicU64,
}

/// Handle to one in-flight call. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskResolver {
    inner: Arc<Inner>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Stat<'a> {
    id: &'a str,
    created_at: DateTime<Utc>,
    uptime: String,
    received: u64,
    #[serde(skip_serializing_if = "is_zero")]
    published: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl TaskResolver {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                name: name.into(),
                created_at: Utc::now(),
                started: std::time::Instant::now(),
                result: OnceLock::new(),
                when_done: Mutex::new(None),
                done: CancellationToken::new(),
                logs: Broadcaster::new(),
                msgs: Broadcaster::new(),
                emitted: AtomicU64::new(0),
                published: AtomicU64::new(0),
                payload_size: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Human readable name; the id prefix when none was given.
    pub fn name(&self) -> &str {
        if !self.inner.name.is_empty() {
            return &self.inner.name;
        }
        self.inner.id.get(..7).unwrap_or(&self.inner.id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Install a hook that runs at settlement, before `done` fires. If the
    /// resolver already settled, the hook runs immediately.
    pub fn set_when_done(&self, hook: impl FnOnce(&Result<Bytes, TaskError>) + Send + 'static) {
        let mut slot = self.inner.when_done.lock().unwrap_or_else(|e| e.into_inner());
        match self.inner.result.get() {
            Some(result) => {
                drop(slot);
                hook(result);
            }
            None => *slot = Some(Box::new(hook)),
        }
    }

    /// Settled value, or `None` before settlement.
    pub fn result(&self) -> Option<Result<Bytes, TaskError>> {
        self.inner.result.get().cloned()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Resolves once settled.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    /// Settle with `Stopped`. Local only: nothing is sent to the remote side.
    pub fn cancel(&self) {
        self.set_result(Err(TaskError::Stopped));
    }

    pub fn log_observer(&self) -> Observer<String> {
        self.inner.logs.observe()
    }

    pub fn msg_observer(&self) -> Observer<Bytes> {
        self.inner.msgs.observe()
    }

    pub fn stat_json(&self) -> serde_json::Value {
        let stat = Stat {
            id: self.id(),
            created_at: self.inner.created_at,
            uptime: format!("{:?}", self.inner.started.elapsed()),
            received: self.inner.emitted.load(Ordering::Relaxed),
            published: self.inner.published.load(Ordering::Relaxed),
        };
        serde_json::to_value(stat).unwrap_or_default()
    }

    // ── Driving ───────────────────────────────────────────────────────────────

    /// Start draining with no outbound actions.
    pub fn start<F>(&self, ctx: &InvocationContext, factory: F) -> &Self
    where
        F: Future<Output = Result<TaskIo, TaskError>> + Send + 'static,
    {
        self.start_with_actions(ctx, factory, None)
    }

    /// Start draining and feed one action to the output sink.
    pub fn start_with_action<F>(&self, ctx: &InvocationContext, factory: F, action: Action) -> &Self
    where
        F: Future<Output = Result<TaskIo, TaskError>> + Send + 'static,
    {
        let source = Broadcaster::new();
        let actions = source.observe();
        source.publish(action);
        source.close();
        self.start_with_actions(ctx, factory, Some(actions))
    }

    /// Start draining and feed every action from `actions` to the output sink.
    pub fn start_with_actions<F>(
        &self,
        ctx: &InvocationContext,
        factory: F,
        actions: Option<Observer<Action>>,
    ) -> &Self
    where
        F: Future<Output = Result<TaskIo, TaskError>> + Send + 'static,
    {
        let this = self.clone();
        let deadline = ctx.effective_deadline();
        self.spawn(ctx, async move { this.io_loop(factory, actions, deadline).await });
        self
    }

    /// Run `work` on behalf of this resolver: settles `Stopped` on context
    /// cancellation, converts panics into a settlement error, and logs one
    /// summary line when done.
    pub fn spawn<F>(&self, ctx: &InvocationContext, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let this = self.clone();
        let cancel = ctx.cancel_token().clone();
        let span = ctx.span().clone();
        tokio::spawn(
            async move {
                let guarded = AssertUnwindSafe(work).catch_unwind();
                tokio::select! {
                    outcome = guarded => {
                        if let Err(panic) = outcome {
                            let err = TaskError::from_panic(panic);
                            if let TaskError::Panic { message, backtrace } = &err {
                                tracing::error!(task = %this.id(), %message, %backtrace, "resolver panicked");
                            }
                            this.set_result(Err(err));
                        }
                    }
                    _ = cancel.cancelled() => this.set_result(Err(TaskError::Stopped)),
                    _ = this.done() => {}
                }
                this.log_summary();
            }
            .instrument(span),
        );
    }

    async fn io_loop<F>(self, factory: F, mut actions: Option<Observer<Action>>, deadline: Option<Instant>)
    where
        F: Future<Output = Result<TaskIo, TaskError>> + Send,
    {
        let TaskIo { input, mut output } = match factory.await {
            Ok(io) => io,
            Err(e) => return self.set_result(Err(e)),
        };
        let Some(mut input) = input else {
            return self.set_result(Err(TaskError::NilInputStream));
        };

        let reader = self.clone();
        tokio::spawn(
            async move {
                let drained = AssertUnwindSafe(async {
                    loop {
                        tokio::select! {
                            _ = reader.done() => return,
                            frame = input.next_frame() => match frame {
                                Ok(Some(line)) => {
                                    if !parse_action(&line, &reader) {
                                        return;
                                    }
                                }
                                Ok(None) => return reader.set_result(Err(TaskError::EmptyResponse)),
                                Err(e) => return reader.set_result(Err(e)),
                            },
                        }
                    }
                })
                .catch_unwind()
                .await;
                if let Err(panic) = drained {
                    reader.set_result(Err(TaskError::from_panic(panic)));
                }
            }
            .in_current_span(),
        );

        let expiry = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = self.done() => return,
                _ = &mut expiry => return self.set_result(Err(TaskError::DeadlineExceeded)),
                batch = next_actions(&mut actions) => {
                    if batch.is_empty() {
                        actions = None;
                        continue;
                    }
                    let Some(sink) = output.as_mut() else {
                        return self.set_result(Err(TaskError::NilOutputStream));
                    };
                    for action in batch {
                        let written = match encode(&action) {
                            Ok(frame) => sink.write_frame(&frame).await,
                            Err(e) => Err(e.into()),
                        };
                        if let Err(e) = written {
                            return self.set_result(Err(e));
                        }
                        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn log_summary(&self) {
        let mut msg = format!(
            "{} done in {:?}, emit {} msgs",
            self.name(),
            self.inner.started.elapsed(),
            self.inner.emitted.load(Ordering::Relaxed)
        );
        let size = self.inner.payload_size.load(Ordering::Relaxed);
        if size > 0 {
            msg.push_str(&format!(
                ", pub {} msg, {} produced",
                self.inner.published.load(Ordering::Relaxed),
                byte_size(size)
            ));
        }
        if let Some(Err(e)) = self.inner.result.get() {
            msg.push_str(&format!(", with error, {}", e));
        }
        tracing::info!(task = %self.id(), "{}", msg);
    }
}

async fn next_actions(actions: &mut Option<Observer<Action>>) -> Vec<Action> {
    match actions {
        Some(observer) => observer.changed().await,
        None => std::future::pending().await,
    }
}

impl TaskParser for TaskResolver {
    fn set_result(&self, result: Result<Bytes, TaskError>) {
        let result = result.map(|data| {
            let trimmed = data.strip_suffix(TOKEN_CRLF).map(|t| t.len()).unwrap_or(data.len());
            data.slice(..trimmed)
        });
        if self.inner.result.set(result).is_err() {
            return;
        }
        let Some(settled) = self.inner.result.get() else {
            return;
        };
        if let Ok(data) = settled {
            self.inner.payload_size.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        let hook = self
            .inner
            .when_done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook(settled);
        }
        self.inner.logs.close();
        self.inner.msgs.close();
        self.inner.done.cancel();
    }

    fn update_log(&self, line: String) {
        self.inner.logs.publish(line);
    }

    fn publish_message(&self, msg: Bytes) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.msgs.publish(msg);
    }
}

impl std::fmt::Debug for TaskResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResolver")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("done", &self.is_done())
            .finish()
    }
}
