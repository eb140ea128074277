//! Classification registry: event-type prefix to replay priority.
//!
//! The priority of a concrete type is that of the **longest** registered
//! prefix the type starts with. Prefixes are unique keys, so two matching
//! prefixes always differ in length and the result never depends on
//! registration order. Types with no matching prefix get
//! [`DEFAULT_PRIORITY`].
//!
//! The registry itself is pure. Rewriting persisted `query_order` values
//! after a registration is done by
//! [`WriteGuard::register_classification`](crate::WriteGuard::register_classification)
//! under the write lock.

use std::sync::{PoisonError, RwLock};

/// Priority of a type that matches no registered prefix.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Built-in classifications present in every registry created with
/// [`ClassificationRegistry::with_defaults`].
pub const DEFAULT_CLASSIFICATIONS: &[(&str, i32)] =
    &[("b-m-r", 2), ("b-m-p-j-alt", 1), ("b-m-p-j", 1)];

/// Thread-safe prefix to priority mapping.
#[derive(Debug, Default)]
pub struct ClassificationRegistry {
    entries: RwLock<Vec<(String, i32)>>,
}

impl ClassificationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with [`DEFAULT_CLASSIFICATIONS`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for (prefix, priority) in DEFAULT_CLASSIFICATIONS {
            registry.register(prefix, *priority);
        }
        registry
    }

    /// Add or overwrite classifications on a registry that is not shared
    /// yet.
    ///
    /// Once a registry is owned by a [`StoreHandle`](crate::StoreHandle),
    /// changes go through
    /// [`StoreHandle::register_classification`](crate::StoreHandle::register_classification)
    /// so persisted priorities are rewritten with them.
    #[must_use]
    pub fn with_classifications<P: AsRef<str>>(
        self,
        classifications: impl IntoIterator<Item = (P, i32)>,
    ) -> Self {
        for (prefix, priority) in classifications {
            self.register(prefix.as_ref(), priority);
        }
        self
    }

    /// Insert or overwrite the priority for `prefix`.
    ///
    /// Returns the previous priority when the prefix was already known.
    pub(crate) fn register(&self, prefix: &str, priority: i32) -> Option<i32> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|(p, _)| p == prefix) {
            let previous = entry.1;
            entry.1 = priority;
            return Some(previous);
        }
        entries.push((prefix.to_owned(), priority));
        None
    }

    /// Priority for a concrete event type.
    pub fn lookup(&self, event_type: &str) -> i32 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(prefix, _)| event_type.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(DEFAULT_PRIORITY, |(_, priority)| *priority)
    }

    /// Snapshot of all registrations in registration order.
    pub fn entries(&self) -> Vec<(String, i32)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of registered prefixes.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no prefix is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_routes_and_jumps() {
        let registry = ClassificationRegistry::with_defaults();
        assert_eq!(registry.lookup("b-m-r"), 2);
        assert_eq!(registry.lookup("b-m-p-j"), 1);
        assert_eq!(registry.lookup("b-m-p-j-alt-x"), 1);
        assert_eq!(registry.lookup("a-f-G-U-C"), DEFAULT_PRIORITY);
    }

    #[test]
    fn empty_type_gets_default() {
        let registry = ClassificationRegistry::with_defaults();
        assert_eq!(registry.lookup(""), DEFAULT_PRIORITY);
    }

    #[test]
    fn longest_prefix_wins_regardless_of_order() {
        let short_first = ClassificationRegistry::new();
        short_first.register("b-m-p-j", 1);
        short_first.register("b-m-p-j-alt", 7);

        let long_first = ClassificationRegistry::new();
        long_first.register("b-m-p-j-alt", 7);
        long_first.register("b-m-p-j", 1);

        assert_eq!(short_first.lookup("b-m-p-j-alt-x"), 7);
        assert_eq!(long_first.lookup("b-m-p-j-alt-x"), 7);
        assert_eq!(short_first.lookup("b-m-p-j-x"), 1);
        assert_eq!(long_first.lookup("b-m-p-j-x"), 1);
    }

    #[test]
    fn register_is_an_upsert() {
        let registry = ClassificationRegistry::new();
        assert_eq!(registry.register("a-h", 3), None);
        assert_eq!(registry.register("a-h", 5), Some(3));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("a-h-G"), 5);
    }

    #[test]
    fn configured_classifications_extend_defaults() {
        let registry = ClassificationRegistry::with_defaults()
            .with_classifications([("a-h", 4), ("b-m-r", 6)]);
        assert_eq!(registry.lookup("a-h-G"), 4);
        assert_eq!(registry.lookup("b-m-r"), 6);
        assert_eq!(registry.lookup("b-m-p-j"), 1);
    }

    #[test]
    fn lookup_is_deterministic() {
        let registry = ClassificationRegistry::with_defaults();
        registry.register("b-m", 9);
        let first = registry.lookup("b-m-p-j-alt");
        for _ in 0..100 {
            assert_eq!(registry.lookup("b-m-p-j-alt"), first);
        }
        assert_eq!(first, 1);
    }
}
