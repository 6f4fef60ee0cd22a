//! Segment bookkeeping for most-visited scoring.
//!
//! A segment groups visits under a canonical per-site name. Day-bucketed
//! visit counters feed the decayed score behind `query_most_visited_urls`.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use super::{record_failure, HistoryBackend};
use crate::transition::{CoreTransition, PageTransition, Qualifiers};
use crate::types::{midnight_of, SegmentId, VisitId, VisitRow, INVALID_SEGMENT_ID, INVALID_VISIT_ID};

/// Canonical segment name: scheme forced to http, a leading `www.` label
/// dropped, query, fragment, port and credentials stripped. Returns None for
/// URLs without a host.
pub fn segment_name_for_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    Some(format!("http://{}{}", host, parsed.path()))
}

impl HistoryBackend {
    /// Picks the segment for a freshly inserted chain-start visit and bumps
    /// its counter for the visit's day. Returns the segment id, or 0 when no
    /// segment applies.
    pub(super) fn assign_segment_for_new_visit(
        &mut self,
        url: &str,
        from_visit: VisitId,
        visit_id: VisitId,
        transition: PageTransition,
        time: DateTime<Utc>,
    ) -> SegmentId {
        if !transition.is_main_frame() {
            return INVALID_SEGMENT_ID;
        }
        let segment_id = self.calculate_segment_id(url, from_visit, transition);
        if segment_id == INVALID_SEGMENT_ID {
            return INVALID_SEGMENT_ID;
        }
        let Some(store) = self.store.as_ref() else {
            return INVALID_SEGMENT_ID;
        };
        let outcome = (|| -> anyhow::Result<()> {
            store.set_segment_id_for_visit(visit_id, segment_id)?;
            store.update_segment_visit_count(segment_id, midnight_of(time), 1)
        })();
        if let Err(err) = outcome {
            record_failure(&mut self.scheduled_kill_db, "assign_segment", &err);
            return INVALID_SEGMENT_ID;
        }
        segment_id
    }

    /// A typed or bookmark navigation opens (or refreshes) its own segment;
    /// anything else inherits the nearest segment up the referring chain.
    fn calculate_segment_id(
        &mut self,
        url: &str,
        from_visit: VisitId,
        transition: PageTransition,
    ) -> SegmentId {
        let qualifies = transition.is_new_navigation()
            && !transition.has(Qualifiers::FORWARD_BACK)
            && (transition.core_type_is(CoreTransition::Typed)
                || transition.core_type_is(CoreTransition::AutoBookmark));

        let Some(store) = self.store.as_ref() else {
            return INVALID_SEGMENT_ID;
        };

        if !qualifies {
            // Walk the referring chain for an already-assigned segment. A
            // seen-set guards against cycles in damaged data.
            let mut current = from_visit;
            let mut seen = HashSet::new();
            while current != INVALID_VISIT_ID && seen.insert(current) {
                let row = match store.get_row_for_visit(current) {
                    Ok(Some(row)) => row,
                    Ok(None) => return INVALID_SEGMENT_ID,
                    Err(err) => {
                        record_failure(&mut self.scheduled_kill_db, "calculate_segment_id", &err);
                        return INVALID_SEGMENT_ID;
                    }
                };
                if row.segment_id != INVALID_SEGMENT_ID {
                    return row.segment_id;
                }
                current = row.referring_visit;
            }
            return INVALID_SEGMENT_ID;
        }

        let Some(name) = segment_name_for_url(url) else {
            return INVALID_SEGMENT_ID;
        };
        let outcome = (|| -> anyhow::Result<SegmentId> {
            let url_id = store
                .get_row_for_url(url)?
                .map(|row| row.id)
                .unwrap_or_default();
            match store.get_segment_named(&name)? {
                Some(segment_id) => {
                    // The most recent qualifying visit becomes the segment's
                    // representative page.
                    if url_id != 0 && store.get_segment_url_id(segment_id)? != Some(url_id) {
                        store.update_segment_representation_url(segment_id, url_id)?;
                    }
                    Ok(segment_id)
                }
                None => store.create_segment(&name, url_id),
            }
        })();
        match outcome {
            Ok(segment_id) => segment_id,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "calculate_segment_id", &err);
                INVALID_SEGMENT_ID
            }
        }
    }

    /// Re-evaluates segment membership after a synced visit changed. Moves
    /// the visit's day counter between segments when the assignment differs.
    pub(super) fn update_segment_for_existing_foreign_visit(&mut self, visit: &VisitRow) {
        if !(self.foreign_segment_policy)(visit) {
            return;
        }
        let url = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            match store.get_url_row(visit.url_id) {
                Ok(Some(row)) => row.url,
                Ok(None) => {
                    debug!(visit_id = visit.id, "segment update for visit without url row");
                    return;
                }
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "update_foreign_segment", &err);
                    return;
                }
            }
        };
        let new_segment =
            self.calculate_segment_id(&url, visit.referring_visit, visit.transition);
        if new_segment == visit.segment_id {
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let slot = midnight_of(visit.visit_time);
        let outcome = (|| -> anyhow::Result<()> {
            if visit.segment_id != INVALID_SEGMENT_ID {
                store.update_segment_visit_count(visit.segment_id, slot, -1)?;
            }
            store.set_segment_id_for_visit(visit.id, new_segment)?;
            if new_segment != INVALID_SEGMENT_ID {
                store.update_segment_visit_count(new_segment, slot, 1)?;
            }
            Ok(())
        })();
        if let Err(err) = outcome {
            record_failure(&mut self.scheduled_kill_db, "update_foreign_segment", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_canonicalization() {
        assert_eq!(
            segment_name_for_url("https://www.example.com/news?id=3#top"),
            Some("http://example.com/news".to_string())
        );
        assert_eq!(
            segment_name_for_url("http://user:pw@example.com:8080/a/b"),
            Some("http://example.com/a/b".to_string())
        );
        assert_eq!(segment_name_for_url("about:blank"), None);
    }
}
