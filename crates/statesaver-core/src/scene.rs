//! The live scene the store keeps in sync with.
//!
//! The scene itself belongs to the host application. This crate only
//! needs to put entities into it during replay, take them out during a
//! swap, and receive the mutations the host wants persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use statesaver_types::{EventRecord, NewEvent};

/// What the store needs from a live scene.
pub trait Scene: Send + Sync + fmt::Debug {
    /// Re-create the entity described by `record`.
    ///
    /// Returns `false` if the scene declined it.
    fn restore(&self, record: &EventRecord) -> bool;

    /// Remove the entity with `uid`. Returns `false` if there was none.
    fn remove(&self, uid: &str) -> bool;

    /// Whether an entity with `uid` exists.
    fn contains(&self, uid: &str) -> bool;
}

/// A change the host wants reflected in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneMutation {
    /// An entity was created or updated and should be saved.
    Persist(NewEvent),
    /// An entity was deleted and should be removed from the store.
    Remove {
        /// Identity of the deleted entity.
        uid: String,
    },
}

impl SceneMutation {
    /// Identity of the entity this mutation is about.
    pub fn uid(&self) -> &str {
        match self {
            Self::Persist(event) => event.uid(),
            Self::Remove { uid } => uid,
        }
    }
}

/// An in-memory scene keyed by uid. Later restores of a uid replace
/// earlier ones.
#[derive(Debug, Default)]
pub struct MemoryScene {
    entities: Mutex<BTreeMap<String, EventRecord>>,
}

impl MemoryScene {
    /// Create an empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the scene is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entities flagged visible.
    pub fn visible_len(&self) -> usize {
        self.lock().values().filter(|r| r.visible).count()
    }

    /// Snapshot of the entity with `uid`.
    pub fn get(&self, uid: &str) -> Option<EventRecord> {
        self.lock().get(uid).cloned()
    }

    /// Uids present, in sorted order.
    pub fn uids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, EventRecord>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scene for MemoryScene {
    fn restore(&self, record: &EventRecord) -> bool {
        self.lock().insert(record.uid.clone(), record.clone());
        true
    }

    fn remove(&self, uid: &str) -> bool {
        self.lock().remove(uid).is_some()
    }

    fn contains(&self, uid: &str) -> bool {
        self.lock().contains_key(uid)
    }
}
