//! Hot provider swap.
//!
//! A swap moves the service from the active store to a new one while the
//! scene stays live:
//!
//! ```text
//! Idle --prepare ok--> Draining --replay stopped--> Installing --> Idle
//!   ^                     |
//!   +---- drain timeout --+
//! ```
//!
//! - **Prepare**: open and migrate the new store. On failure nothing has
//!   been touched.
//! - **Draining**: detach the listener, cancel the running replay and wait
//!   for it (bounded), then remove every scene entity whose uid is in the
//!   old store.
//! - **Installing**: publish the new store, attach a fresh listener,
//!   replay from the new store if the startup replay had been requested,
//!   and close the old store in the background.
//!
//! The coordination lock is held for the whole swap and the write lock
//! from prepare to install, so writers see either the old store or the
//! new one and never both.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use statesaver_db::{EventStore, MigrationReport, StorageProvider};

use crate::error::SwapError;
use crate::replayer::InitialReplayer;
use crate::saver::StateSaver;

/// Phase of the swap state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapPhase {
    /// No swap in progress.
    Idle,
    /// Writers detached, waiting for the replay to stop.
    Draining,
    /// Publishing the new store.
    Installing,
}

impl From<SwapPhase> for u8 {
    fn from(phase: SwapPhase) -> Self {
        match phase {
            SwapPhase::Idle => 0,
            SwapPhase::Draining => 1,
            SwapPhase::Installing => 2,
        }
    }
}

impl From<u8> for SwapPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::Installing,
            _ => Self::Idle,
        }
    }
}

/// Drain timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSettings {
    /// Longest time to wait for a running replay to stop.
    pub drain_timeout: Duration,
    /// Interval between progress checks while waiting.
    pub poll_interval: Duration,
}

impl Default for SwapSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What a successful swap did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    /// Location of the store swapped out.
    pub from: String,
    /// Location of the store swapped in.
    pub to: String,
    /// Migration applied to the new store when it was opened.
    pub migration: MigrationReport,
    /// Scene entities removed because they came from the old store.
    pub removed_entities: u64,
    /// Whether a replay from the new store was started.
    pub replay_restarted: bool,
    /// Wall time of the whole swap.
    pub elapsed: Duration,
}

/// Returns the phase to idle however the swap ends.
struct PhaseReset<'a>(&'a StateSaver);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.set_phase(SwapPhase::Idle);
    }
}

impl StateSaver {
    /// Swap the active store for the one behind `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`SwapError::Prepare`] if the new store cannot be opened or
    /// migrated, and [`SwapError::DrainTimeout`] if the running replay does
    /// not stop within the drain timeout. Either way the old store stays
    /// active and writable.
    pub async fn swap(
        &self,
        provider: Arc<dyn StorageProvider>,
    ) -> Result<SwapReport, SwapError> {
        let started = Instant::now();
        let mut replay = self.replay.lock().await;
        let mut guard = self.handle.write().await;

        let from = guard.provider().describe();
        let to = provider.describe();
        tracing::info!(from = %from, to = %to, "Swap requested");

        let new_store = match EventStore::open(Arc::clone(&provider), guard.registry()).await {
            Ok(store) => Arc::new(store),
            Err(source) => {
                tracing::warn!(to = %to, error = %source, "Swap aborted: new store not usable");
                return Err(SwapError::Prepare {
                    location: to,
                    source,
                });
            }
        };

        let _reset = PhaseReset(self);
        self.set_phase(SwapPhase::Draining);
        self.listener().detach();

        if let Some(task) = replay.task.take() {
            task.cancel();
            match task
                .wait(self.settings.drain_timeout, self.settings.poll_interval)
                .await
            {
                Ok(outcome) => tracing::info!(
                    restored = outcome.restored,
                    cancelled = outcome.cancelled,
                    "Replay drained"
                ),
                Err(task) => {
                    replay.task = Some(task);
                    self.attach_listener();
                    new_store.close().await;
                    let waited = self.settings.drain_timeout;
                    tracing::warn!(
                        from = %from,
                        to = %to,
                        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "Swap aborted: replay did not stop"
                    );
                    return Err(SwapError::DrainTimeout { waited });
                }
            }
        }

        let removed_entities = match guard.current() {
            Some(old) => self.remove_scene_entities(old).await,
            None => 0,
        };

        self.set_phase(SwapPhase::Installing);
        let replaced = guard.install(provider, Arc::clone(&new_store));
        self.attach_listener();
        drop(guard);

        let replay_restarted = replay.started;
        if replay_restarted {
            replay.task =
                Some(InitialReplayer::new(Arc::clone(&new_store), Arc::clone(&self.scene)).spawn());
        }
        drop(replay);

        if let Some(old) = replaced {
            tokio::spawn(async move { old.close().await });
        }

        let report = SwapReport {
            from,
            to,
            migration: *new_store.migration(),
            removed_entities,
            replay_restarted,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            from = %report.from,
            to = %report.to,
            removed_entities = report.removed_entities,
            replay_restarted = report.replay_restarted,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Swap complete"
        );
        Ok(report)
    }

    async fn remove_scene_entities(&self, old: &EventStore) -> u64 {
        let uids = match old.uids().await {
            Ok(uids) => uids,
            Err(e) => {
                tracing::warn!(
                    location = %old.describe(),
                    error = %e,
                    "Could not list old-store uids"
                );
                return 0;
            }
        };
        let mut removed: u64 = 0;
        for uid in &uids {
            if self.scene.contains(uid) && self.scene.remove(uid) {
                removed = removed.saturating_add(1);
            }
        }
        tracing::debug!(candidates = uids.len(), removed, "Removed old-store entities from scene");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [SwapPhase::Idle, SwapPhase::Draining, SwapPhase::Installing] {
            assert_eq!(SwapPhase::from(u8::from(phase)), phase);
        }
        assert_eq!(SwapPhase::from(200), SwapPhase::Idle);
    }
}
