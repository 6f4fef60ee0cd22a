//! Ephemeral map linking new navigations to their referrers/openers without
//! a database round-trip.
//!
//! Keyed by (browsing-context id, navigation-entry id, URL); holds the most
//! recent VisitId recorded for that triple. Purely reconstructable state,
//! cleared on backend shutdown.

use std::collections::HashMap;

use crate::types::{ContextId, VisitId, INVALID_VISIT_ID};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VisitKey {
    context_id: ContextId,
    nav_entry_id: i32,
    url: String,
}

#[derive(Debug, Default)]
pub struct VisitTracker {
    visits: HashMap<VisitKey, VisitId>,
    // Reverse index so deletion notifications can evict by VisitId.
    by_id: HashMap<VisitId, VisitKey>,
}

impl VisitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent visit recorded for this (context, nav entry, url) triple,
    /// or `INVALID_VISIT_ID` when the referrer is unknown.
    pub fn get_last_visit(&self, context_id: ContextId, nav_entry_id: i32, url: &str) -> VisitId {
        let key = VisitKey { context_id, nav_entry_id, url: url.to_string() };
        self.visits.get(&key).copied().unwrap_or(INVALID_VISIT_ID)
    }

    pub fn add_visit(&mut self, context_id: ContextId, nav_entry_id: i32, url: &str, visit_id: VisitId) {
        let key = VisitKey { context_id, nav_entry_id, url: url.to_string() };
        if let Some(old) = self.visits.insert(key.clone(), visit_id) {
            self.by_id.remove(&old);
        }
        self.by_id.insert(visit_id, key);
    }

    /// Evicts a deleted visit so later navigations can no longer chain to it.
    pub fn remove_visit_by_id(&mut self, visit_id: VisitId) {
        if let Some(key) = self.by_id.remove(&visit_id) {
            self.visits.remove(&key);
        }
    }

    /// Drops everything recorded for one browsing context (e.g. a closed
    /// tab).
    pub fn clear_cached_data_for_context(&mut self, context_id: ContextId) {
        self.visits.retain(|key, visit_id| {
            let keep = key.context_id != context_id;
            if !keep {
                self.by_id.remove(visit_id);
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        self.visits.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_visit_resolution() {
        let mut tracker = VisitTracker::new();
        assert_eq!(tracker.get_last_visit(1, 7, "https://a.test/"), INVALID_VISIT_ID);

        tracker.add_visit(1, 7, "https://a.test/", 42);
        assert_eq!(tracker.get_last_visit(1, 7, "https://a.test/"), 42);

        // Same triple, newer visit wins.
        tracker.add_visit(1, 7, "https://a.test/", 43);
        assert_eq!(tracker.get_last_visit(1, 7, "https://a.test/"), 43);

        // Different nav entry is a different key.
        assert_eq!(tracker.get_last_visit(1, 8, "https://a.test/"), INVALID_VISIT_ID);
    }

    #[test]
    fn test_remove_by_id() {
        let mut tracker = VisitTracker::new();
        tracker.add_visit(1, 7, "https://a.test/", 42);
        tracker.remove_visit_by_id(42);
        assert_eq!(tracker.get_last_visit(1, 7, "https://a.test/"), INVALID_VISIT_ID);
    }

    #[test]
    fn test_clear_context() {
        let mut tracker = VisitTracker::new();
        tracker.add_visit(1, 7, "https://a.test/", 42);
        tracker.add_visit(2, 7, "https://b.test/", 43);
        tracker.clear_cached_data_for_context(1);
        assert_eq!(tracker.get_last_visit(1, 7, "https://a.test/"), INVALID_VISIT_ID);
        assert_eq!(tracker.get_last_visit(2, 7, "https://b.test/"), 43);
    }
}
