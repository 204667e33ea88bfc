//! Execution lifecycle and progress.
//!
//! The scheduler is the single owner of an execution's [`ExecutionState`].
//! Every change goes through one `watch` channel, so pollers always see a
//! whole snapshot and terminal states are sticky. When a store is injected,
//! each change is mirrored into it under the same write.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::store::ExecutionStore;
use super::types::{ExecutionState, ExecutionStatus};

pub const EXECUTION_TIMEOUT_MESSAGE: &str = "execution timeout";

struct Inner {
    state: watch::Sender<ExecutionState>,
    store: Option<Arc<ExecutionStore>>,
    deadline: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(execution_id: impl Into<String>, store: Option<Arc<ExecutionStore>>) -> Self {
        let initial = ExecutionState::pending(execution_id);
        if let Some(store) = &store {
            store.create(initial.clone());
        }
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                state,
                store,
                deadline: Mutex::new(None),
            }),
        }
    }

    pub fn execution_id(&self) -> String {
        self.inner.state.borrow().execution_id.clone()
    }

    /// Apply `change` unless it returns false; publish to the store if applied.
    fn modify(&self, change: impl FnOnce(&mut ExecutionState) -> bool) -> bool {
        let store = self.inner.store.as_ref();
        self.inner.state.send_if_modified(|state| {
            if !change(state) {
                return false;
            }
            state.updated_at = Utc::now();
            state.recompute_percent();
            if let Some(store) = store {
                store.update(state.clone());
            }
            true
        })
    }

    pub fn initialize(&self, total: usize) {
        let changed = self.modify(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.status = ExecutionStatus::Running;
            state.total = total;
            state.completed = 0;
            state.stage = "running".to_string();
            true
        });
        if changed {
            info!(execution_id = %self.execution_id(), total, "execution started");
        }
    }

    /// Count one finished task. Never exceeds `total`; ignored once terminal.
    pub fn advance(&self, stage: impl Into<String>) -> usize {
        let stage = stage.into();
        self.modify(|state| {
            if state.status.is_terminal() || state.completed >= state.total {
                return false;
            }
            state.completed += 1;
            state.stage = stage;
            true
        });
        self.inner.state.borrow().completed
    }

    /// Relabel the current stage without counting progress.
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        self.modify(|state| {
            if state.status.is_terminal() || state.stage == stage {
                return false;
            }
            state.stage = stage;
            true
        });
    }

    /// Fail the execution with `execution timeout` if it is still running
    /// after `after`.
    pub fn start_deadline(&self, after: Duration) {
        self.start_deadline_with(after, |scheduler| {
            warn!(
                execution_id = %scheduler.execution_id(),
                "execution deadline reached"
            );
            scheduler.fail(EXECUTION_TIMEOUT_MESSAGE);
        });
    }

    /// Run `on_timeout` after `after` unless a terminal transition happens first.
    pub fn start_deadline_with<F>(&self, after: Duration, on_timeout: F)
    where
        F: FnOnce(&Scheduler) + Send + 'static,
    {
        let deadline = chrono::Duration::from_std(after)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.modify(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.deadline = deadline;
            true
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                let scheduler = Scheduler { inner };
                if !scheduler.is_terminal() {
                    on_timeout(&scheduler);
                }
            }
        });

        let previous = self
            .inner
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel_deadline(&self) {
        let handle = self
            .inner
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn finish(&self, change: impl FnOnce(&mut ExecutionState)) -> bool {
        let changed = self.modify(|state| {
            if state.status.is_terminal() {
                return false;
            }
            change(state);
            true
        });
        self.cancel_deadline();
        changed
    }

    /// Terminal: all tasks accounted for. No-op if already terminal.
    pub fn complete(&self) -> bool {
        let changed = self.finish(|state| {
            state.status = ExecutionStatus::Completed;
            state.stage = "completed".to_string();
            state.missing_count = Some(0);
        });
        if changed {
            info!(execution_id = %self.execution_id(), "execution completed");
        }
        changed
    }

    /// Terminal: some tasks have no outcome. No-op if already terminal.
    pub fn partial(&self, missing: usize) -> bool {
        let changed = self.finish(|state| {
            state.status = ExecutionStatus::PartiallyCompleted;
            state.stage = "partially_completed".to_string();
            state.missing_count = Some(missing);
        });
        if changed {
            info!(execution_id = %self.execution_id(), missing, "execution partially completed");
        }
        changed
    }

    /// Terminal: failed with `reason`. No-op if already terminal.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.finish(|state| {
            state.status = ExecutionStatus::Failed;
            state.stage = "failed".to_string();
            state.error_message = Some(reason.clone());
        });
        if changed {
            warn!(execution_id = %self.execution_id(), reason = %reason, "execution failed");
        }
        changed
    }

    pub fn snapshot(&self) -> ExecutionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.state.borrow().status.is_terminal()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the execution reaches a terminal state.
    pub async fn wait_terminal(&self) -> ExecutionState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.status.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        };
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic_and_capped() {
        let scheduler = Scheduler::new("e", None);
        scheduler.initialize(3);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(scheduler.advance("task"));
        }
        assert_eq!(seen, vec![1, 2, 3, 3, 3]);
        assert_eq!(scheduler.snapshot().progress_percent, 100);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let scheduler = Scheduler::new("e", None);
        scheduler.initialize(2);
        scheduler.advance("a");
        assert!(scheduler.fail("boom"));
        assert!(!scheduler.complete());
        assert!(!scheduler.partial(1));
        assert_eq!(scheduler.advance("b"), 1);

        let state = scheduler.snapshot();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("boom"));
        scheduler.initialize(10);
        assert_eq!(scheduler.snapshot(), state);
    }

    #[tokio::test]
    async fn concurrent_advances_are_all_counted() {
        let scheduler = Scheduler::new("e", None);
        scheduler.initialize(200);
        let handles: Vec<_> = (0..200)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler.advance("task");
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(scheduler.snapshot().completed, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_a_running_execution() {
        let scheduler = Scheduler::new("e", None);
        scheduler.initialize(1);
        scheduler.start_deadline(Duration::from_secs(5));
        assert!(scheduler.snapshot().deadline.is_some());

        let state = scheduler.wait_terminal().await;
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some(EXECUTION_TIMEOUT_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_never_overwrites_completion() {
        let scheduler = Scheduler::new("e", None);
        scheduler.initialize(1);
        scheduler.start_deadline(Duration::from_secs(5));
        scheduler.advance("done");
        scheduler.complete();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.snapshot().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn wait_terminal_resolves_on_completion_from_another_task() {
        let scheduler = Scheduler::new("e", None);
        scheduler.initialize(1);

        let finisher = scheduler.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            finisher.advance("only");
            finisher.complete();
        });

        let state = scheduler.wait_terminal().await;
        handle.await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.completed, 1);

        let again = scheduler.wait_terminal().await;
        assert_eq!(again, state);
    }

    #[tokio::test]
    async fn store_mirrors_every_change() {
        let store = Arc::new(ExecutionStore::default());
        let scheduler = Scheduler::new("e", Some(store.clone()));
        assert_eq!(
            store.get("e").unwrap().state.status,
            ExecutionStatus::Pending
        );

        scheduler.initialize(2);
        scheduler.advance("first");
        assert_eq!(store.get("e").unwrap().state.completed, 1);

        scheduler.partial(1);
        let stored = store.get("e").unwrap().state;
        assert_eq!(stored, scheduler.snapshot());
        assert_eq!(stored.missing_count, Some(1));
    }
}
