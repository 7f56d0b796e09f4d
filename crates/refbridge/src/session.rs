//! Session registry: which handle ids belong to which session.
//!
//! Lives inside the handle table's lock; it only indexes ids, the values
//! themselves stay in the table.

use ahash::AHashMap;
use indexmap::IndexSet;

#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    /// Session id -> handle ids in insertion order.
    sessions: AHashMap<String, IndexSet<String>>,
}

impl SessionRegistry {
    pub fn insert(&mut self, session_id: &str, id: &str) {
        self.sessions
            .entry(session_id.to_owned())
            .or_default()
            .insert(id.to_owned());
    }

    /// Forgets one id; the session disappears with its last handle.
    pub fn remove(&mut self, session_id: &str, id: &str) {
        if let Some(ids) = self.sessions.get_mut(session_id) {
            ids.shift_remove(id);
            if ids.is_empty() {
                self.sessions.remove(session_id);
            }
        }
    }

    /// Removes the session and returns every id it held.
    pub fn take(&mut self, session_id: &str) -> Vec<String> {
        self.sessions
            .remove(session_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn session_len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, IndexSet::len)
    }

    /// Sessions with at least one live handle, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_vanishes_with_last_handle() {
        let mut registry = SessionRegistry::default();
        registry.insert("s", "a");
        registry.insert("s", "b");
        registry.remove("s", "a");
        assert_eq!(registry.session_len("s"), 1);
        registry.remove("s", "b");
        assert!(registry.sessions().is_empty());
    }

    #[test]
    fn take_returns_ids_in_insertion_order() {
        let mut registry = SessionRegistry::default();
        registry.insert("s", "b");
        registry.insert("s", "a");
        registry.insert("t", "c");
        assert_eq!(registry.take("s"), vec!["b".to_owned(), "a".to_owned()]);
        assert!(registry.take("s").is_empty());
        assert_eq!(registry.sessions(), vec!["t".to_owned()]);
    }
}
