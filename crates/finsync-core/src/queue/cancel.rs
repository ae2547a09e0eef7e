//! Per-process registry of cancellation tokens for leased jobs.
//!
//! The durable `cancel_requested` flag lives in the job store; this registry
//! is how a request reaches a handler running in this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::domain::JobId;

struct CancelEntry {
    attempt: u32,
    token: CancellationToken,
    /// Set when cancellation came from a user request rather than shutdown.
    requested: bool,
}

#[derive(Clone, Default)]
pub struct CancelRegistry {
    entries: Arc<Mutex<HashMap<JobId, CancelEntry>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<JobId, CancelEntry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut entries)
    }

    /// Token for a freshly leased job. A newer attempt replaces the entry
    /// of an older lease on the same job.
    pub fn register(&self, id: JobId, attempt: u32) -> CancellationToken {
        let token = CancellationToken::new();
        self.with_entries(|entries| {
            entries.insert(
                id,
                CancelEntry {
                    attempt,
                    token: token.clone(),
                    requested: false,
                },
            )
        });
        token
    }

    /// User-requested cancellation. Returns whether the job runs here.
    pub fn request(&self, id: JobId) -> bool {
        self.with_entries(|entries| match entries.get_mut(&id) {
            Some(entry) => {
                entry.requested = true;
                entry.token.cancel();
                true
            }
            None => false,
        })
    }

    /// Shutdown: cancel every token without marking the jobs as requested.
    pub fn interrupt_all(&self) -> usize {
        self.with_entries(|entries| {
            for entry in entries.values() {
                entry.token.cancel();
            }
            entries.len()
        })
    }

    pub fn was_requested(&self, id: JobId) -> bool {
        self.with_entries(|entries| entries.get(&id).is_some_and(|e| e.requested))
    }

    /// Drop the entry of the lease holding `attempt`; a newer lease on the
    /// same job keeps its token.
    pub fn remove(&self, id: JobId, attempt: u32) {
        self.with_entries(|entries| {
            if entries.get(&id).is_some_and(|e| e.attempt == attempt) {
                entries.remove(&id);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn request_cancels_only_the_named_job() {
        let registry = CancelRegistry::new();
        let a = JobId::from_ulid(Ulid::new());
        let b = JobId::from_ulid(Ulid::new());
        let ta = registry.register(a, 1);
        let tb = registry.register(b, 1);

        assert!(registry.request(a));
        assert!(ta.is_cancelled());
        assert!(!tb.is_cancelled());
        assert!(registry.was_requested(a));
        assert!(!registry.was_requested(b));

        assert!(!registry.request(JobId::from_ulid(Ulid::new())));
    }

    #[test]
    fn interrupt_is_not_a_request() {
        let registry = CancelRegistry::new();
        let id = JobId::from_ulid(Ulid::new());
        let token = registry.register(id, 1);

        assert_eq!(registry.interrupt_all(), 1);
        assert!(token.is_cancelled());
        assert!(!registry.was_requested(id));

        registry.remove(id, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_attempt_keeps_newer_token() {
        let registry = CancelRegistry::new();
        let id = JobId::from_ulid(Ulid::new());
        registry.register(id, 1);
        let newer = registry.register(id, 2);

        registry.remove(id, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.request(id));
        assert!(newer.is_cancelled());

        registry.remove(id, 2);
        assert!(registry.is_empty());
    }
}
