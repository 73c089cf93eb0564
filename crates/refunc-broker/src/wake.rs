//! Wake signals — cold-start rendezvous between waiting calls and an
//! instance announcing itself.
//!
//! The first waiter for an instance creates a record and starts a poke loop
//! that repeatedly asks the instance to announce. Later waiters share the
//! record. The record is removed, and its loop stopped, when the instance
//! announces or when its last waiter leaves, whichever happens first.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct WakeRecord {
    id: u64,
    waiters: usize,
    online: CancellationToken,
}

#[derive(Default)]
struct Counters {
    next_id: AtomicU64,
    loops: AtomicU64,
    pokes: AtomicU64,
}

/// Wake records keyed by the instance's announce subject.
#[derive(Clone)]
pub struct WakeSignals {
    records: Arc<DashMap<String, WakeRecord>>,
    counters: Arc<Counters>,
    poke_interval: Duration,
}

impl WakeSignals {
    pub fn new(poke_interval: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            poke_interval,
        }
    }

    /// Join the wait for `key`. Creates the record and starts poking with
    /// `poke` if no one is waiting yet.
    pub fn join<F, Fut>(&self, key: &str, poke: F) -> WakeGuard
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, online) = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let record = e.get_mut();
                record.waiters += 1;
                (record.id, record.online.clone())
            }
            Entry::Vacant(e) => {
                let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed);
                let online = CancellationToken::new();
                e.insert(WakeRecord {
                    id,
                    waiters: 1,
                    online: online.clone(),
                });
                self.counters.loops.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(poke_loop(
                    key.to_string(),
                    online.clone(),
                    self.poke_interval,
                    self.counters.clone(),
                    poke,
                ));
                (id, online)
            }
        };
        WakeGuard {
            signals: self.clone(),
            key: key.to_string(),
            id,
            online,
        }
    }

    /// The instance behind `key` is online: release every waiter.
    /// Returns false when nobody was waiting.
    pub fn announce(&self, key: &str) -> bool {
        match self.records.remove(key) {
            Some((_, record)) => {
                tracing::debug!(key, waiters = record.waiters, "got cry");
                record.online.cancel();
                true
            }
            None => false,
        }
    }

    fn leave(&self, key: &str, id: u64) {
        if let Entry::Occupied(mut e) = self.records.entry(key.to_string()) {
            let record = e.get_mut();
            if record.id != id {
                return;
            }
            record.waiters = record.waiters.saturating_sub(1);
            if record.waiters == 0 {
                let (_, record) = e.remove_entry();
                record.online.cancel();
                tracing::debug!(key, "last waiter left, wake record dropped");
            }
        }
    }

    pub fn is_waiting(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn waiters(&self, key: &str) -> usize {
        self.records.get(key).map(|r| r.waiters).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Poke loops started so far.
    pub fn loops_started(&self) -> u64 {
        self.counters.loops.load(Ordering::Relaxed)
    }

    /// Pokes sent so far, over all loops.
    pub fn pokes(&self) -> u64 {
        self.counters.pokes.load(Ordering::Relaxed)
    }
}

async fn poke_loop<F, Fut>(key: String, online: CancellationToken, every: Duration, counters: Arc<Counters>, poke: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now(), every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = online.cancelled() => break,
            _ = ticker.tick() => {
                counters.pokes.fetch_add(1, Ordering::Relaxed);
                poke().await;
            }
        }
    }
    tracing::trace!(key = %key, "poke loop stopped");
}

/// One waiter's membership in a wake record. Leaves on drop.
pub struct WakeGuard {
    signals: WakeSignals,
    key: String,
    id: u64,
    online: CancellationToken,
}

impl WakeGuard {
    /// Resolves when the instance announces (or the record is dropped).
    pub async fn online(&self) {
        self.online.cancelled().await
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.signals.leave(&self.key, self.id);
    }
}
