//! Live-call store — at most one resolver per request id.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::error::TaskError;
use crate::resolver::TaskResolver;

type Slot = Arc<OnceCell<Result<TaskResolver, TaskError>>>;

/// In-flight calls keyed by request id.
///
/// Entries stay until `delete` is called; owners remove them once the
/// resolver settles.
#[derive(Clone, Default)]
pub struct LiveTaskStore {
    tasks: Arc<DashMap<String, Slot>>,
}

impl LiveTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the resolver for `id`, running `factory` if there is none.
    ///
    /// Concurrent callers for one id share a single factory run and all get
    /// the same resolver; `created` is true only for the caller whose factory
    /// ran. A factory error is handed to every waiting caller.
    pub async fn get_or_create<F, Fut>(&self, id: &str, factory: F) -> Result<(TaskResolver, bool), TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TaskResolver, TaskError>>,
    {
        let slot: Slot = self.tasks.entry(id.to_string()).or_default().clone();
        let mut created = false;
        let outcome = slot
            .get_or_init(|| {
                created = true;
                factory()
            })
            .await;
        match outcome {
            Ok(tr) => Ok((tr.clone(), created)),
            Err(e) => Err(e.clone()),
        }
    }

    /// The resolver for `id`, if its factory completed successfully.
    pub fn get(&self, id: &str) -> Option<TaskResolver> {
        let slot = self.tasks.get(id)?;
        match slot.get() {
            Some(Ok(tr)) => Some(tr.clone()),
            _ => None,
        }
    }

    pub fn delete(&self, id: &str) {
        self.tasks.remove(id);
    }

    /// Visit every live resolver; entries still being created, or whose
    /// factory failed, are skipped. Stops early when `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&str, &TaskResolver) -> bool) {
        for entry in self.tasks.iter() {
            if let Some(Ok(tr)) = entry.value().get() {
                if !f(entry.key(), tr) {
                    return;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
