//! Keyed store of execution snapshots and reports for pollers.
//!
//! Injected into the scheduler, which publishes every state change here.
//! Terminal executions expire `ttl` after their last update; running ones
//! never do.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::types::{ExecutionState, FinalReport};

/// What a poller gets back for one execution.
#[derive(Debug, Clone)]
pub struct StoredExecution {
    pub state: ExecutionState,
    pub report: Option<Arc<FinalReport>>,
}

struct Entry {
    state: ExecutionState,
    report: Option<Arc<FinalReport>>,
    touched: Instant,
}

impl Entry {
    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        self.state.status.is_terminal() && now.saturating_duration_since(self.touched) >= ttl
    }
}

pub struct ExecutionStore {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ExecutionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new execution, replacing any previous entry with the same id.
    pub fn create(&self, state: ExecutionState) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            state.execution_id.clone(),
            Entry {
                state,
                report: None,
                touched: Instant::now(),
            },
        );
    }

    /// Replace the stored snapshot. Creates the entry if it is missing.
    pub fn update(&self, state: ExecutionState) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match entries.get_mut(&state.execution_id) {
            Some(entry) => {
                entry.state = state;
                entry.touched = now;
            }
            None => {
                entries.insert(
                    state.execution_id.clone(),
                    Entry {
                        state,
                        report: None,
                        touched: now,
                    },
                );
            }
        }
    }

    /// Returns false if the execution is unknown or already expired.
    pub fn attach_report(&self, execution_id: &str, report: FinalReport) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(execution_id) {
            Some(entry) => {
                entry.report = Some(Arc::new(report));
                entry.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<StoredExecution> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.get(execution_id)?;
            if !entry.expired(self.ttl, now) {
                return Some(StoredExecution {
                    state: entry.state.clone(),
                    report: entry.report.clone(),
                });
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(execution_id)
            .is_some_and(|entry| entry.expired(self.ttl, now))
        {
            entries.remove(execution_id);
            debug!(execution_id = %execution_id, "expired execution dropped on read");
        }
        None
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(self.ttl, now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "purged expired executions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
