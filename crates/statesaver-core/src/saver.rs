//! The `StateSaver` service.
//!
//! [`StateSaver`] ties the pieces together. It owns the store handle
//! (and through it the write lock), the live scene, the attached
//! [`WriterListener`] and the replay slot.
//!
//! # Locks
//!
//! - **Coordination lock** (`replay`): serializes swaps, replay start,
//!   zeroize and shutdown. Held across a whole swap.
//! - **Write lock** (inside [`StoreHandle`]): serializes every mutation.
//!
//! When both are needed the coordination lock is always taken first.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use statesaver_db::{DbError, StoreHandle};
use tokio::sync::Mutex;

use crate::config::StateSaverConfig;
use crate::error::StateSaverError;
use crate::listener::{WriteOutcome, WriterListener};
use crate::replayer::{InitialReplayer, ReplayOutcome, ReplayTask};
use crate::scene::{Scene, SceneMutation};
use crate::swap::{SwapPhase, SwapSettings};

/// Replay bookkeeping, guarded by the coordination lock.
#[derive(Debug, Default)]
pub(crate) struct ReplaySlot {
    /// Set once the host has signalled that its components are ready.
    pub(crate) started: bool,
    /// The pass currently (or most recently) running.
    pub(crate) task: Option<ReplayTask>,
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Current swap phase.
    pub phase: SwapPhase,
    /// Location of the active provider.
    pub location: String,
    /// Rows in the active store, if one is open.
    pub rows: Option<u64>,
    /// Whether a replay pass is running.
    pub replay_running: bool,
    /// Whether the startup replay has been requested.
    pub replay_started: bool,
}

/// Keeps a live scene and an event store in sync.
#[derive(Debug)]
pub struct StateSaver {
    pub(crate) handle: Arc<StoreHandle>,
    pub(crate) scene: Arc<dyn Scene>,
    listener: RwLock<Arc<WriterListener>>,
    pub(crate) replay: Mutex<ReplaySlot>,
    phase: AtomicU8,
    pub(crate) settings: SwapSettings,
}

impl StateSaver {
    /// Create the service. Nothing is opened until the first write,
    /// read or replay.
    pub fn new(handle: Arc<StoreHandle>, scene: Arc<dyn Scene>, settings: SwapSettings) -> Self {
        let listener = Arc::new(WriterListener::new(Arc::clone(&handle)));
        Self {
            handle,
            scene,
            listener: RwLock::new(listener),
            replay: Mutex::new(ReplaySlot::default()),
            phase: AtomicU8::new(SwapPhase::Idle.into()),
            settings,
        }
    }

    /// Create the service from configuration.
    pub fn from_config(config: &StateSaverConfig, scene: Arc<dyn Scene>) -> Self {
        let handle = Arc::new(StoreHandle::new(
            config.storage.provider(),
            config.registry(),
        ));
        Self::new(handle, scene, config.swap.settings())
    }

    /// The store handle.
    pub const fn handle(&self) -> &Arc<StoreHandle> {
        &self.handle
    }

    /// The live scene.
    pub const fn scene(&self) -> &Arc<dyn Scene> {
        &self.scene
    }

    /// Current swap phase.
    pub fn phase(&self) -> SwapPhase {
        SwapPhase::from(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: SwapPhase) {
        tracing::debug!(?phase, "Swap phase");
        self.phase.store(phase.into(), Ordering::Release);
    }

    /// The currently attached listener.
    pub fn listener(&self) -> Arc<WriterListener> {
        Arc::clone(&self.listener.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the listener with a fresh, attached one.
    pub(crate) fn attach_listener(&self) {
        let fresh = Arc::new(WriterListener::new(Arc::clone(&self.handle)));
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Persist one scene mutation through the attached listener.
    pub async fn on_scene_mutation(&self, mutation: &SceneMutation) -> WriteOutcome {
        self.listener().on_mutation(mutation).await
    }

    /// Start the startup replay. Only the first call does anything.
    ///
    /// Returns whether a replay was started.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be opened.
    pub async fn components_ready(&self) -> Result<bool, DbError> {
        let mut replay = self.replay.lock().await;
        if replay.started {
            tracing::debug!("Components already reported ready");
            return Ok(false);
        }
        let store = self.handle.open().await?;
        replay.task = Some(InitialReplayer::new(store, Arc::clone(&self.scene)).spawn());
        replay.started = true;
        Ok(true)
    }

    /// Register a classification and rewrite persisted priorities.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the rewrite fails.
    pub async fn add_classification(&self, prefix: &str, priority: i32) -> Result<u64, DbError> {
        self.handle.register_classification(prefix, priority).await
    }

    /// Wait for the current replay pass, if any, to finish.
    pub async fn wait_for_replay(&self) -> Option<ReplayOutcome> {
        let task = self.replay.lock().await.task.take()?;
        Some(task.join().await)
    }

    /// Whether a replay pass is running.
    pub async fn replay_running(&self) -> bool {
        self.replay
            .lock()
            .await
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop any replay, close the store and destroy its backing file.
    ///
    /// The next write starts a fresh, empty store on the same provider.
    ///
    /// # Errors
    ///
    /// Returns [`StateSaverError::DrainTimeout`] if the running replay does
    /// not stop within the drain timeout; the store is left untouched and
    /// the replay stays tracked. Returns [`StateSaverError::Db`] if the
    /// backing file cannot be removed.
    pub async fn zeroize(&self) -> Result<(), StateSaverError> {
        let mut replay = self.replay.lock().await;
        if let Err(waited) = self.stop_replay(&mut replay).await {
            tracing::warn!(
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "Zeroize aborted: replay did not stop"
            );
            return Err(StateSaverError::DrainTimeout { waited });
        }
        self.handle.zeroize().await?;
        Ok(())
    }

    /// Stop any replay, detach the listener and close the store.
    ///
    /// A replay that outlives the drain timeout is aborted; closing the
    /// store then waits at most for the scene call it is inside.
    pub async fn shutdown(&self) {
        let mut replay = self.replay.lock().await;
        if self.stop_replay(&mut replay).await.is_err() {
            if let Some(task) = replay.task.take() {
                task.abort();
            }
            tracing::warn!("Replay did not stop in time; aborted");
        }
        self.listener().detach();
        self.handle.shutdown().await;
        tracing::info!("StateSaver shut down");
    }

    /// Point-in-time status.
    pub async fn status(&self) -> StatusReport {
        let (replay_running, replay_started) = {
            let replay = self.replay.lock().await;
            let running = replay.task.as_ref().is_some_and(|t| !t.is_finished());
            (running, replay.started)
        };
        let rows = match self.handle.current().await {
            Some(store) => store.count().await.ok(),
            None => None,
        };
        StatusReport {
            phase: self.phase(),
            location: self.handle.provider().await.describe(),
            rows,
            replay_running,
            replay_started,
        }
    }

    /// Cancel the running pass and wait for it within the drain timeout.
    ///
    /// A pass that outlives the timeout is put back in the slot and the
    /// time waited is returned as the error.
    async fn stop_replay(&self, replay: &mut ReplaySlot) -> Result<(), Duration> {
        let Some(task) = replay.task.take() else {
            return Ok(());
        };
        task.cancel();
        match task
            .wait(self.settings.drain_timeout, self.settings.poll_interval)
            .await
        {
            Ok(_) => Ok(()),
            Err(task) => {
                replay.task = Some(task);
                Err(self.settings.drain_timeout)
            }
        }
    }
}
