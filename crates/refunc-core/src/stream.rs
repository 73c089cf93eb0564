//! Broadcast stream — one producer, any number of independent observers.
//!
//! Every observer receives every value published after it attached, in
//! publish order. Each observer owns an unbounded queue, so a slow reader
//! never blocks the producer.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Fan-out publisher. Cheap to clone; all clones feed the same observers.
pub struct Broadcaster<T> {
    inner: Arc<Mutex<State<T>>>,
}

struct State<T> {
    subscribers: Vec<UnboundedSender<T>>,
    closed: bool,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `value` to every live observer. Observers that were dropped
    /// are pruned. Publishing after `close` is a no-op.
    pub fn publish(&self, value: T) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Attach a new observer. An observer attached after `close` sees an
    /// already-finished stream.
    pub fn observe(&self) -> Observer<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        if !state.closed {
            state.subscribers.push(tx);
        }
        Observer { rx, finished: false }
    }

    /// End the stream. Observers drain what is buffered, then see the end.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }
}

/// Read handle for a `Broadcaster`.
pub struct Observer<T> {
    rx: UnboundedReceiver<T>,
    finished: bool,
}

impl<T> Observer<T> {
    /// Wait for the next value. `None` once the producer closed and the
    /// backlog is empty.
    pub async fn next(&mut self) -> Option<T> {
        let value = self.rx.recv().await;
        if value.is_none() {
            self.finished = true;
        }
        value
    }

    /// Wait until at least one value is buffered, then take everything that
    /// is. An empty vec means the stream ended.
    pub async fn changed(&mut self) -> Vec<T> {
        match self.next().await {
            Some(first) => {
                let mut batch = vec![first];
                batch.extend(self.drain());
                batch
            }
            None => Vec::new(),
        }
    }

    /// Take every value buffered right now without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(v) => out.push(v),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.finished = true;
                    break;
                }
            }
        }
        out
    }

    /// True while more values may still arrive.
    pub fn has_next(&self) -> bool {
        !self.finished
    }
}
