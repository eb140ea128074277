//! Control channel into the service.
//!
//! Hosts that cannot call [`StateSaver`] directly send
//! [`ControlMessage`]s over an mpsc channel. The loop handles messages one
//! at a time in arrival order, so mutations sent for one uid are persisted
//! in the order they were sent.

use std::sync::Arc;

use statesaver_db::StorageProvider;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::StateSaverError;
use crate::saver::{StateSaver, StatusReport};
use crate::scene::SceneMutation;

/// Default capacity of the control channel.
pub const CONTROL_CHANNEL_CAPACITY: usize = 256;

/// A request to the service.
#[derive(Debug)]
pub enum ControlMessage {
    /// The host's components are up; start the startup replay.
    ComponentsReady,
    /// Register or overwrite a classification.
    AddClassification {
        /// Event-type prefix.
        prefix: String,
        /// Replay priority for the prefix.
        priority: i32,
    },
    /// Destroy the active store's backing database.
    Zeroize,
    /// Swap to the store behind `provider`.
    Swap {
        /// Provider of the new store.
        provider: Arc<dyn StorageProvider>,
    },
    /// Persist a scene mutation.
    Mutation(SceneMutation),
    /// Report status on `reply`.
    Status {
        /// Where to send the report.
        reply: oneshot::Sender<StatusReport>,
    },
}

/// Create a control channel with the default capacity.
pub fn channel() -> (mpsc::Sender<ControlMessage>, mpsc::Receiver<ControlMessage>) {
    mpsc::channel(CONTROL_CHANNEL_CAPACITY)
}

/// Drive `saver` from `rx` until every sender is dropped.
pub fn spawn_control_loop(
    saver: Arc<StateSaver>,
    mut rx: mpsc::Receiver<ControlMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = dispatch(&saver, message).await {
                tracing::error!(error = %e, "Control message failed");
            }
        }
        tracing::debug!("Control channel closed");
    })
}

/// Handle one message.
///
/// # Errors
///
/// Returns [`StateSaverError`] if the requested operation failed. Write
/// failures of mutations are logged by the listener and are not errors.
pub async fn dispatch(saver: &StateSaver, message: ControlMessage) -> Result<(), StateSaverError> {
    match message {
        ControlMessage::ComponentsReady => {
            let started = saver.components_ready().await?;
            tracing::info!(started, "Components ready");
        }
        ControlMessage::AddClassification { prefix, priority } => {
            let rewritten = saver.add_classification(&prefix, priority).await?;
            tracing::info!(prefix = %prefix, priority, rewritten, "Classification applied");
        }
        ControlMessage::Zeroize => saver.zeroize().await?,
        ControlMessage::Swap { provider } => {
            saver.swap(provider).await?;
        }
        ControlMessage::Mutation(mutation) => {
            let outcome = saver.on_scene_mutation(&mutation).await;
            tracing::debug!(uid = mutation.uid(), ?outcome, "Mutation handled");
        }
        ControlMessage::Status { reply } => {
            if reply.send(saver.status().await).is_err() {
                tracing::debug!("Status requester went away");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use statesaver_db::{ClassificationRegistry, MemoryProvider, StoreHandle};
    use statesaver_types::NewEvent;

    use super::*;
    use crate::scene::MemoryScene;
    use crate::swap::{SwapPhase, SwapSettings};

    fn saver() -> Arc<StateSaver> {
        Arc::new(StateSaver::new(
            Arc::new(StoreHandle::new(
                Arc::new(MemoryProvider::new("control-test")),
                ClassificationRegistry::with_defaults(),
            )),
            Arc::new(MemoryScene::new()),
            SwapSettings::default(),
        ))
    }

    #[tokio::test]
    async fn loop_applies_messages_in_order() {
        let saver = saver();
        let (tx, rx) = channel();
        let task = spawn_control_loop(Arc::clone(&saver), rx);

        for event_type in ["a-f-G", "a-h-G", "a-n-G"] {
            let event = NewEvent::new("u1", event_type, "{}").unwrap();
            tx.send(ControlMessage::Mutation(SceneMutation::Persist(event)))
                .await
                .unwrap();
        }
        tx.send(ControlMessage::AddClassification {
            prefix: "a-n".to_owned(),
            priority: 4,
        })
        .await
        .unwrap();

        let (reply, status) = oneshot::channel();
        tx.send(ControlMessage::Status { reply }).await.unwrap();
        let status = status.await.unwrap();
        assert_eq!(status.phase, SwapPhase::Idle);
        assert_eq!(status.rows, Some(1));

        drop(tx);
        task.await.unwrap();

        let latest = saver.handle().lookup_by_uid("u1").await.unwrap().unwrap();
        assert_eq!(latest.event_type, "a-n-G");
        assert_eq!(latest.query_order, 4);
    }
}
