//! `StateSaver` daemon.
//!
//! Hosts the service over an in-memory scene and drives it from
//! line-oriented commands on stdin (see [`command`]). Every command goes
//! through the service's control channel, so commands are applied one at
//! a time in the order they were read.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (first argument, default `statesaver.yaml`)
//! 2. Initialize structured logging (tracing)
//! 3. Create the service and spawn its control loop
//! 4. Read commands until EOF or Ctrl-C
//! 5. Drain the control loop and shut the service down

mod command;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use statesaver_core::config::LoggingConfig;
use statesaver_core::control::{self, ControlMessage};
use statesaver_core::{MemoryScene, SceneMutation, StateSaver, StateSaverConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::command::Command;
use crate::error::DaemonError;

/// Config file read when no path is given.
const DEFAULT_CONFIG_PATH: &str = "statesaver.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or stdin fails.
#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    // 1. Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = load_config(&config_path)?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!(
        config = %config_path.display(),
        provider = ?config.storage.provider,
        path = %config.storage.path.display(),
        classifications = config.classifications.len(),
        "statesaver-daemon starting"
    );

    // 3. Create the service.
    let saver = Arc::new(StateSaver::from_config(&config, Arc::new(MemoryScene::new())));
    let (tx, rx) = control::channel();
    let control_loop = control::spawn_control_loop(Arc::clone(&saver), rx);

    // 4. Read commands.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("End of input");
                    break;
                };
                match Command::parse(&line) {
                    Ok(Some(command)) => execute(&config, &tx, command).await?,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Ignoring command"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // 5. Drain and shut down.
    drop(tx);
    if let Err(e) = control_loop.await {
        tracing::error!(error = %e, "Control loop panicked");
    }
    saver.shutdown().await;
    info!("statesaver-daemon shutdown complete");
    Ok(())
}

/// Turn a command into a control message and send it.
async fn execute(
    config: &StateSaverConfig,
    tx: &mpsc::Sender<ControlMessage>,
    command: Command,
) -> Result<(), DaemonError> {
    let message = match command {
        Command::Ready => ControlMessage::ComponentsReady,
        Command::Classify { prefix, priority } => {
            ControlMessage::AddClassification { prefix, priority }
        }
        Command::Persist(event) => ControlMessage::Mutation(SceneMutation::Persist(event)),
        Command::Remove(uid) => ControlMessage::Mutation(SceneMutation::Remove { uid }),
        Command::Swap(path) => ControlMessage::Swap {
            provider: Arc::new(config.storage.file_provider(path)),
        },
        Command::Zeroize => ControlMessage::Zeroize,
        Command::Status => {
            let (reply, status) = oneshot::channel();
            send(tx, ControlMessage::Status { reply }).await?;
            let status = status.await.map_err(|e| DaemonError::ControlClosed {
                message: e.to_string(),
            })?;
            match serde_json::to_string(&status) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, "Could not encode status"),
            }
            return Ok(());
        }
    };
    send(tx, message).await
}

async fn send(
    tx: &mpsc::Sender<ControlMessage>,
    message: ControlMessage,
) -> Result<(), DaemonError> {
    tx.send(message)
        .await
        .map_err(|e| DaemonError::ControlClosed {
            message: e.to_string(),
        })
}

/// Load configuration from `path`, falling back to defaults (plus
/// environment overrides) when the file does not exist.
fn load_config(path: &Path) -> Result<StateSaverConfig, DaemonError> {
    if path.exists() {
        Ok(StateSaverConfig::from_file(path)?)
    } else {
        Ok(StateSaverConfig::parse("")?)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
