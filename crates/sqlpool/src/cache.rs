//! Per-connection prepared statement cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use sqlpool_client::{PreparedStatement, StatementSpec};

/// A physical statement parked in, or checked out of, the cache.
pub(crate) struct CachedStatement {
    /// The physical statement.
    pub(crate) stmt: Arc<dyn PreparedStatement>,
    /// Pool-assigned statement id, stable across cache round-trips.
    pub(crate) id: u64,
}

/// Map from statement identity to reusable prepared statements, plus the
/// reverse index used to re-file a statement when its close is intercepted.
///
/// Guarded by its own mutex: the preparing caller and the close/error
/// delivery path touch it concurrently.
#[derive(Default)]
pub(crate) struct StatementCache {
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    reusable: HashMap<StatementSpec, VecDeque<CachedStatement>>,
    index: HashMap<u64, StatementSpec>,
}

impl StatementCache {
    /// Remove and return a cached statement for `spec`, if one is parked.
    ///
    /// The entry leaves the queue before the statement is handed out, so
    /// concurrent callers can never receive the same instance.
    pub(crate) fn take(&self, spec: &StatementSpec) -> Option<CachedStatement> {
        let mut inner = self.inner.lock();
        let queue = inner.reusable.get_mut(spec)?;
        let cached = queue.pop_front();
        if queue.is_empty() {
            inner.reusable.remove(spec);
        }
        cached
    }

    /// Record a freshly prepared statement in the reverse index.
    pub(crate) fn register(&self, id: u64, spec: StatementSpec) {
        self.inner.lock().index.insert(id, spec);
    }

    /// Park a statement whose close was intercepted.
    ///
    /// Returns `false` when the statement is no longer indexed — it errored
    /// and was purged — in which case the caller must close it for real.
    pub(crate) fn park(&self, cached: CachedStatement) -> bool {
        let mut inner = self.inner.lock();
        let Some(spec) = inner.index.get(&cached.id).cloned() else {
            return false;
        };
        inner.reusable.entry(spec).or_default().push_back(cached);
        true
    }

    /// Purge an errored statement: delete its reverse-index entry and drop
    /// it from any queue. It is never handed out again.
    pub(crate) fn purge(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.index.remove(&id);
        inner.reusable.retain(|_, queue| {
            queue.retain(|cached| cached.id != id);
            !queue.is_empty()
        });
    }

    /// Number of statements currently parked for reuse.
    pub(crate) fn parked(&self) -> usize {
        self.inner.lock().reusable.values().map(VecDeque::len).sum()
    }
}
