//! Initial replay: re-populate the scene from a store.
//!
//! A replay walks the store in replay order, one
//! [`EventStore::replay_page`] at a time, and hands each record to
//! [`Scene::restore`]. The connection is only held while a page is read,
//! so writers keep going during a long replay even on a single-connection
//! pool. Cancellation is cooperative: the flag is checked
//! before every row, so a replay stops within one row of being cancelled.
//! A scene that blocks inside `restore` delays that, which is why waiting
//! for a replay is always bounded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use statesaver_db::{EventStore, ReplayCursor};
use tokio::task::JoinHandle;

use crate::scene::Scene;

/// Rows read per page.
const REPLAY_PAGE_SIZE: u32 = 256;

/// Shared cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the replay to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a replay pass ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Records the scene accepted.
    pub restored: u64,
    /// Whether the pass stopped early because it was cancelled.
    pub cancelled: bool,
    /// Whether the pass stopped early because the store failed.
    pub failed: bool,
}

/// One replay pass over one store.
#[derive(Debug)]
pub struct InitialReplayer {
    store: Arc<EventStore>,
    scene: Arc<dyn Scene>,
    cancel: CancelFlag,
}

impl InitialReplayer {
    /// Create a pass over `store` into `scene`.
    pub fn new(store: Arc<EventStore>, scene: Arc<dyn Scene>) -> Self {
        Self {
            store,
            scene,
            cancel: CancelFlag::new(),
        }
    }

    /// The flag that stops this pass.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the pass to completion or cancellation.
    pub async fn run(self) -> ReplayOutcome {
        let location = self.store.describe();
        tracing::info!(location = %location, "Replay started");

        let mut outcome = ReplayOutcome::default();
        let mut cursor: Option<ReplayCursor> = None;
        'pages: loop {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let page = match self.store.replay_page(cursor, REPLAY_PAGE_SIZE).await {
                Ok(page) if page.is_empty() => break,
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(location = %location, error = %e, "Replay aborted");
                    outcome.failed = true;
                    break;
                }
            };
            for record in &page {
                if self.cancel.is_cancelled() {
                    outcome.cancelled = true;
                    break 'pages;
                }
                if self.scene.restore(record) {
                    outcome.restored = outcome.restored.saturating_add(1);
                } else {
                    tracing::debug!(uid = %record.uid, "Scene declined record");
                }
                cursor = Some(ReplayCursor::from(record));
            }
        }

        tracing::info!(
            location = %location,
            restored = outcome.restored,
            cancelled = outcome.cancelled,
            "Replay finished"
        );
        outcome
    }

    /// Run the pass on a spawned task.
    pub fn spawn(self) -> ReplayTask {
        let cancel = self.cancel_flag();
        let join = tokio::spawn(self.run());
        ReplayTask { cancel, join }
    }
}

/// A replay pass running on its own task.
#[derive(Debug)]
pub struct ReplayTask {
    cancel: CancelFlag,
    join: JoinHandle<ReplayOutcome>,
}

impl ReplayTask {
    /// Ask the pass to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the pass and abort its task at the next await point.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.join.abort();
    }

    /// Whether the pass has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait up to `timeout` for the pass to end, logging every
    /// `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns the still-running task if it outlives `timeout`.
    pub async fn wait(
        mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<ReplayOutcome, Self> {
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut waited = Duration::ZERO;
        loop {
            let step = poll_interval.min(timeout.saturating_sub(waited));
            match tokio::time::timeout(step, &mut self.join).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Replay task ended abnormally");
                    return Ok(ReplayOutcome {
                        cancelled: true,
                        ..ReplayOutcome::default()
                    });
                }
                Err(_) => {
                    waited = waited.saturating_add(step);
                    if waited >= timeout {
                        return Err(self);
                    }
                    tracing::warn!(
                        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "Waiting for replay to stop"
                    );
                }
            }
        }
    }

    /// Wait for the pass to end, however long it takes.
    pub async fn join(self) -> ReplayOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Replay task ended abnormally");
                ReplayOutcome {
                    cancelled: true,
                    ..ReplayOutcome::default()
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use statesaver_db::{ClassificationRegistry, MemoryProvider, StoreHandle};
    use statesaver_types::NewEvent;

    use super::*;
    use crate::scene::MemoryScene;

    async fn seeded_handle(rows: usize) -> StoreHandle {
        let handle = StoreHandle::new(
            Arc::new(MemoryProvider::new("replay-test")),
            ClassificationRegistry::with_defaults(),
        );
        let mut guard = handle.write().await;
        for n in 0..rows {
            let uid = format!("u{n}");
            guard.insert(&NewEvent::new(&uid, "a-f-G", "{}").unwrap()).await.unwrap();
        }
        drop(guard);
        handle
    }

    #[tokio::test]
    async fn restores_every_row() {
        let handle = seeded_handle(5).await;
        let scene = Arc::new(MemoryScene::new());
        let outcome = InitialReplayer::new(handle.open().await.unwrap(), scene.clone())
            .run()
            .await;
        assert_eq!(outcome.restored, 5);
        assert!(!outcome.cancelled);
        assert_eq!(scene.len(), 5);
    }

    #[tokio::test]
    async fn cancelled_before_start_restores_nothing() {
        let handle = seeded_handle(3).await;
        let scene = Arc::new(MemoryScene::new());
        let replayer = InitialReplayer::new(handle.open().await.unwrap(), scene.clone());
        replayer.cancel_flag().cancel();
        let outcome = replayer.run().await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.restored, 0);
        assert!(scene.is_empty());
    }

    /// Scene that takes a while per record.
    #[derive(Debug, Default)]
    struct SlowScene(MemoryScene);

    impl Scene for SlowScene {
        fn restore(&self, record: &statesaver_types::EventRecord) -> bool {
            std::thread::sleep(Duration::from_millis(2));
            self.0.restore(record)
        }

        fn remove(&self, uid: &str) -> bool {
            self.0.remove(uid)
        }

        fn contains(&self, uid: &str) -> bool {
            self.0.contains(uid)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_proceed_during_replay_on_a_single_connection() {
        let handle = seeded_handle(300).await;
        let scene = Arc::new(SlowScene::default());
        let task = InitialReplayer::new(handle.open().await.unwrap(), scene.clone()).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let write = async {
            handle
                .write()
                .await
                .insert(&NewEvent::new("late", "a-f-G", "{}").unwrap())
                .await
        };
        tokio::time::timeout(Duration::from_millis(300), write)
            .await
            .unwrap()
            .unwrap();
        assert!(!task.is_finished());

        let outcome = task.join().await;
        assert!(!outcome.cancelled);
        assert!(outcome.restored >= 300);
        assert!(scene.0.contains("u299"));
    }

    #[tokio::test]
    async fn spawned_task_can_be_waited_on() {
        let handle = seeded_handle(2).await;
        let scene = Arc::new(MemoryScene::new());
        let task = InitialReplayer::new(handle.open().await.unwrap(), scene).spawn();
        let outcome = task
            .wait(Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome.restored, 2);
    }
}
