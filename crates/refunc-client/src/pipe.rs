//! Pipe transport — a resolver bound to a local worker process.
//!
//! The worker reads one `req` frame on stdin and answers with `log` frames
//! and one terminal `rsp`/`err` frame on stdout. Processes that complete a
//! call successfully go back to a pool and serve the next call; failed ones
//! are closed.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use refunc_core::messages::gen_id;
use refunc_core::{Action, ActionType, Broadcaster, InvokeRequest, Observer};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::context::InvocationContext;
use crate::error::TaskError;
use crate::parse::TaskParser;
use crate::resolver::{FrameSink, FrameSource, LineReader, LineWriter, TaskIo, TaskResolver};

/// Something with stdin/stdout that speaks the line protocol.
#[async_trait]
pub trait Process: Send + Sync {
    async fn start(&self) -> Result<(), TaskError>;

    /// Exclusive handle to stdin for the duration of one call.
    async fn stdin(&self) -> Option<Box<dyn FrameSink>>;

    /// Exclusive handle to stdout for the duration of one call.
    async fn stdout(&self) -> Option<Box<dyn FrameSource>>;

    /// Stderr lines, if the process exposes them.
    fn stderr(&self) -> Option<Observer<String>> {
        None
    }

    fn pid(&self) -> Option<u32>;

    async fn close(&self) -> Result<(), TaskError>;
}

/// Builds a fresh, unstarted process.
pub type ProcessFactory = Arc<dyn Fn() -> Arc<dyn Process> + Send + Sync>;

// ── ChildProcess ──────────────────────────────────────────────────────────────

/// OS subprocess with piped stdio.
pub struct ChildProcess {
    command: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    child: Mutex<Option<Child>>,
    stdin: OnceLock<Arc<Mutex<LineWriter<ChildStdin>>>>,
    stdout: OnceLock<Arc<Mutex<LineReader<ChildStdout>>>>,
    stderr: Broadcaster<String>,
    pid: OnceLock<u32>,
    closed: AtomicBool,
}

impl ChildProcess {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            envs: Vec::new(),
            child: Mutex::new(None),
            stdin: OnceLock::new(),
            stdout: OnceLock::new(),
            stderr: Broadcaster::new(),
            pid: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Process for ChildProcess {
    async fn start(&self) -> Result<(), TaskError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(TaskError::Config("process already started".into()));
        }
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Transport(format!("spawn {}: {}", self.command, e)))?;

        let stdin = child.stdin.take().ok_or(TaskError::NilOutputStream)?;
        let stdout = child.stdout.take().ok_or(TaskError::NilInputStream)?;
        if let Some(stderr) = child.stderr.take() {
            let sink = self.stderr.clone();
            tokio::spawn(async move {
                let mut lines = LineReader::new(stderr);
                while let Ok(Some(line)) = lines.next_frame().await {
                    sink.publish(String::from_utf8_lossy(&line).into_owned());
                }
                sink.close();
            });
        }

        let _ = self.stdin.set(Arc::new(Mutex::new(LineWriter::new(stdin))));
        let _ = self.stdout.set(Arc::new(Mutex::new(LineReader::new(stdout))));
        if let Some(pid) = child.id() {
            let _ = self.pid.set(pid);
        }
        tracing::debug!(command = %self.command, pid = ?child.id(), "worker process started");
        *slot = Some(child);
        Ok(())
    }

    async fn stdin(&self) -> Option<Box<dyn FrameSink>> {
        let pipe = self.stdin.get()?.clone();
        Some(Box::new(pipe.lock_owned().await))
    }

    async fn stdout(&self) -> Option<Box<dyn FrameSource>> {
        let pipe = self.stdout.get()?.clone();
        Some(Box::new(pipe.lock_owned().await))
    }

    fn stderr(&self) -> Option<Observer<String>> {
        Some(self.stderr.observe())
    }

    fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    async fn close(&self) -> Result<(), TaskError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        tracing::debug!(pid = ?self.pid(), "closing worker process");
        child
            .kill()
            .await
            .map_err(|e| TaskError::Transport(format!("kill {}: {}", self.command, e)))
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Idle processes keyed by worker identity.
#[derive(Clone, Default)]
pub struct ProcessPool {
    idle: Arc<DashMap<String, Vec<Arc<dyn Process>>>>,
}

impl ProcessPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self, key: &str) -> Option<Arc<dyn Process>> {
        self.idle.get_mut(key).and_then(|mut procs| procs.pop())
    }

    pub fn put(&self, key: &str, process: Arc<dyn Process>) {
        tracing::debug!(key, pid = ?process.pid(), "recycled process");
        self.idle.entry(key.to_string()).or_default().push(process);
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.idle.get(key).map(|procs| procs.len()).unwrap_or(0)
    }

    /// Close every idle process.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.idle.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, procs)) = self.idle.remove(&key) {
                for p in procs {
                    if let Err(e) = p.close().await {
                        tracing::warn!(key = %key, error = %e, "failed to close pooled process");
                    }
                }
            }
        }
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

/// Start a resolver that runs `request` on a pooled (or freshly spawned)
/// process for worker `key`.
pub fn new_pipe_resolver(
    ctx: &InvocationContext,
    key: &str,
    request: &InvokeRequest,
    pool: &ProcessPool,
    spawn: ProcessFactory,
) -> Result<TaskResolver, TaskError> {
    let action = Action::new(ActionType::Request, request)?;
    let id = if request.request_id.is_empty() {
        gen_id(&[key.as_bytes(), request.args_bytes()])
    } else {
        request.request_id.clone()
    };
    let name = format!("{}<{}>", key, id.get(..7).unwrap_or(&id));
    let tr = TaskResolver::new(id, name);

    let target = tr.clone();
    let pool = pool.clone();
    let key = key.to_string();
    let factory = async move {
        let process = match pool.take(&key) {
            Some(p) => p,
            None => {
                let p = spawn();
                p.start().await?;
                p
            }
        };

        let recycled = process.clone();
        target.set_when_done(move |result| {
            if result.is_ok() {
                pool.put(&key, recycled);
                return;
            }
            tokio::spawn(async move {
                if let Err(e) = recycled.close().await {
                    tracing::warn!(error = %e, "failed to close worker process");
                }
            });
        });

        if let Some(mut stderr) = process.stderr() {
            let logs = target.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = logs.done() => break,
                        batch = stderr.changed() => {
                            if batch.is_empty() {
                                break;
                            }
                            for line in batch {
                                logs.update_log(line);
                            }
                        }
                    }
                }
            });
        }

        Ok::<_, TaskError>(TaskIo {
            input: process.stdout().await,
            output: process.stdin().await,
        })
    };

    tr.start_with_action(ctx, factory, action);
    Ok(tr)
}
