//! Run supersession: one in-flight run per concurrency key.
//!
//! Registering a run under a key that already has one cancels the older run.
//! Cancellation is cooperative: runners poll `RunHandle::is_cancelled` before
//! side effects and `select!` on `RunHandle::cancelled` around stages.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

struct ActiveRun {
    run_id: String,
    cancel: watch::Sender<bool>,
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

/// A registered run. Cloning shares the cancellation signal.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub key: String,
    rx: watch::Receiver<bool>,
}

impl RunHandle {
    /// A handle nothing can cancel, for one-off runs.
    pub fn detached(key: &str) -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the value at `false` forever.
        drop(tx);
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the run has been superseded. Never resolves for a run
    /// that completes normally.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run under `key`, cancelling whichever run held it before.
    pub async fn register(&self, key: &str) -> RunHandle {
        let (tx, rx) = watch::channel(false);
        let run_id = uuid::Uuid::new_v4().to_string();

        let previous = {
            let mut runs = self.runs.write().await;
            runs.insert(
                key.to_string(),
                ActiveRun {
                    run_id: run_id.clone(),
                    cancel: tx,
                },
            )
        };

        if let Some(prev) = previous {
            tracing::info!(
                "[RunRegistry] Run {} on '{}' superseded by {}",
                prev.run_id,
                key,
                run_id
            );
            let _ = prev.cancel.send(true);
        }

        RunHandle {
            run_id,
            key: key.to_string(),
            rx,
        }
    }

    /// Drop the registration if `handle` is still the active run for its key.
    pub async fn complete(&self, handle: &RunHandle) {
        let mut runs = self.runs.write().await;
        if runs.get(&handle.key).map(|r| r.run_id == handle.run_id).unwrap_or(false) {
            runs.remove(&handle.key);
        }
    }

    pub async fn active_run(&self, key: &str) -> Option<String> {
        self.runs.read().await.get(key).map(|r| r.run_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_newer_run_cancels_older() {
        let registry = RunRegistry::new();
        let first = registry.register("test-refs/heads/master").await;
        assert!(!first.is_cancelled());

        let second = registry.register("test-refs/heads/master").await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), first.cancelled())
            .await
            .expect("first run should observe cancellation");
        assert_eq!(
            registry.active_run("test-refs/heads/master").await,
            Some(second.run_id.clone())
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let registry = RunRegistry::new();
        let a = registry.register("test-refs/heads/master").await;
        let _b = registry.register("test-refs/pull/7/merge").await;
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn test_complete_only_removes_own_registration() {
        let registry = RunRegistry::new();
        let first = registry.register("k").await;
        let second = registry.register("k").await;

        registry.complete(&first).await;
        assert_eq!(registry.active_run("k").await, Some(second.run_id.clone()));

        registry.complete(&second).await;
        assert_eq!(registry.active_run("k").await, None);
    }

    #[tokio::test]
    async fn test_detached_never_cancels() {
        let handle = RunHandle::detached("k");
        assert!(!handle.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(50), handle.cancelled()).await;
        assert!(waited.is_err());
    }
}
