//! `StateSaver` service: keeps a live scene in sync with an event store.
//!
//! # Data flow
//!
//! ```text
//! scene mutation --> WriterListener --(write lock)--> EventStore
//! EventStore --scan_replay_order--> InitialReplayer --> Scene
//! swap request --> StateSaver::swap (prepare / drain / install)
//! ```
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment overrides
//! - [`scene`] -- The live-scene contract and an in-memory scene
//! - [`listener`] -- Scene mutations to store writes
//! - [`replayer`] -- Cancellable scene re-population
//! - [`saver`] -- The service and its locks
//! - [`swap`] -- Hot provider swap
//! - [`control`] -- mpsc control channel
//! - [`error`] -- Service error types

pub mod config;
pub mod control;
pub mod error;
pub mod listener;
pub mod replayer;
pub mod saver;
pub mod scene;
pub mod swap;

pub use config::{ConfigError, StateSaverConfig};
pub use control::{ControlMessage, spawn_control_loop};
pub use error::{StateSaverError, SwapError};
pub use listener::{WriteOutcome, WriterListener};
pub use replayer::{CancelFlag, InitialReplayer, ReplayOutcome, ReplayTask};
pub use saver::{StateSaver, StatusReport};
pub use scene::{MemoryScene, Scene, SceneMutation};
pub use swap::{SwapPhase, SwapReport, SwapSettings};
