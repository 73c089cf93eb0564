//! Message bus seam.
//!
//! `MessageBus` is the subject-addressed publish/subscribe surface the broker
//! transport and the broker itself are written against. `LocalBus` is the
//! in-process implementation used by `refuncd` and by the tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use refunc_core::subjects;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::BusError;

/// One delivered message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Where the receiver should answer, if anywhere.
    pub reply: Option<String>,
    pub payload: Bytes,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `subject`. A request with a reply address fails
    /// with `NoResponders` when nobody listens.
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to `subject` (wildcards allowed). Subscribers sharing a
    /// `queue` name split the traffic: each message goes to one of them.
    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<Subscription, BusError>;

    /// A fresh unique reply subject.
    fn new_inbox(&self) -> String {
        subjects::inbox(&uuid::Uuid::new_v4().simple().to_string())
    }

    /// Single request/reply exchange bound to `deadline`.
    async fn request(&self, subject: &str, payload: Bytes, deadline: Instant) -> Result<BusMessage, BusError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox, None).await?;
        self.publish(subject, Some(&inbox), payload).await?;
        match tokio::time::timeout_at(deadline, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }
}

// ── Subscription ──────────────────────────────────────────────────────────────

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Live subscription. Unsubscribes exactly once, on `unsubscribe()` or drop.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::UnboundedReceiver<BusMessage>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message; `None` once unsubscribed or the bus is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Next already-delivered message, without waiting.
    pub fn try_next(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
            self.rx.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ── LocalBus ──────────────────────────────────────────────────────────────────

struct LocalSub {
    pattern: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct LocalBusInner {
    subs: DashMap<u64, LocalSub>,
    next_id: AtomicU64,
}

/// In-process bus with NATS subject semantics.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions matching `subject`.
    pub fn interest(&self, subject: &str) -> usize {
        self.inner
            .subs
            .iter()
            .filter(|s| subjects::subject_matches(&s.pattern, subject))
            .count()
    }

    fn deliver(&self, msg: BusMessage) -> usize {
        let mut direct = Vec::new();
        let mut groups: std::collections::HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>> =
            std::collections::HashMap::new();
        for entry in self.inner.subs.iter() {
            if !subjects::subject_matches(&entry.pattern, &msg.subject) {
                continue;
            }
            match &entry.queue {
                Some(q) => groups.entry(q.clone()).or_default().push(entry.tx.clone()),
                None => direct.push(entry.tx.clone()),
            }
        }

        let mut rng = rand::thread_rng();
        let picked = groups.into_values().filter_map(|members| members.choose(&mut rng).cloned());
        direct
            .into_iter()
            .chain(picked)
            .filter(|tx| tx.send(msg.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError> {
        if subject.is_empty() || subject.contains(['*', '>']) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }
        let delivered = self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        });
        if delivered == 0 && reply.is_some() {
            return Err(BusError::NoResponders(subject.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<Subscription, BusError> {
        if subject.is_empty() {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.insert(
            id,
            LocalSub {
                pattern: subject.to_string(),
                queue: queue.map(str::to_string),
                tx,
            },
        );
        let weak: Weak<LocalBusInner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(subject, rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subs.remove(&id);
            }
        }))
    }
}
