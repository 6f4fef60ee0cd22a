//! Visit and URL expiration.
//!
//! All deletion paths funnel through `delete_visits`: it unwinds segment
//! usage, removes orphaned URL rows together with their keyword terms and
//! segments, and reports what changed so the engine can notify and clean up
//! favicons.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::store::HistoryStore;
use crate::types::{
    midnight_of, DeletionInfo, DeletionReason, UrlId, UrlRow, VisitRow, INVALID_SEGMENT_ID,
};

/// How many old visits one expiration pass removes at most.
pub const EXPIRATION_BATCH_SIZE: usize = 500;

/// Everything a deletion changed, for notification and favicon cleanup.
#[derive(Debug, Default)]
pub struct DeletionEffects {
    pub deleted_rows: Vec<UrlRow>,
    pub deleted_visit_ids: Vec<i64>,
    pub deleted_visit_times: Vec<DateTime<Utc>>,
    /// URL rows that lost visits but survived with updated counts.
    pub modified_urls: Vec<UrlRow>,
    /// Page URLs whose favicon mappings can go away.
    pub deleted_page_urls: Vec<String>,
}

impl DeletionEffects {
    pub fn into_deletion_info(self, reason: DeletionReason) -> DeletionInfo {
        DeletionInfo {
            is_all_history: false,
            reason,
            deleted_rows: self.deleted_rows,
            deleted_visit_ids: self.deleted_visit_ids,
        }
    }
}

/// Deletes the given visits and repairs everything hanging off them.
/// URL rows left without visits are removed unless `keep_urls` names them.
pub fn delete_visits(
    store: &HistoryStore,
    visits: &[VisitRow],
    keep_urls: &HashSet<UrlId>,
) -> Result<DeletionEffects> {
    let mut effects = DeletionEffects::default();
    let mut affected_urls: HashSet<UrlId> = HashSet::new();

    for visit in visits {
        if visit.segment_id != INVALID_SEGMENT_ID {
            store.update_segment_visit_count(
                visit.segment_id,
                midnight_of(visit.visit_time),
                -1,
            )?;
        }
        store.delete_visit(visit.id)?;
        effects.deleted_visit_ids.push(visit.id);
        effects.deleted_visit_times.push(visit.visit_time);
        affected_urls.insert(visit.url_id);
    }

    for url_id in affected_urls {
        let Some(mut row) = store.get_url_row(url_id)? else {
            continue;
        };
        let remaining = store.count_visits_for_url(url_id)?;
        if remaining == 0 && !keep_urls.contains(&url_id) {
            delete_url_internals(store, &row)?;
            effects.deleted_page_urls.push(row.url.clone());
            effects.deleted_rows.push(row);
        } else {
            let (visit_count, typed_count, last_visit) = store.recompute_url_counts(url_id)?;
            row.visit_count = visit_count;
            row.typed_count = typed_count;
            row.last_visit = last_visit;
            store.update_url_row(&row)?;
            effects.modified_urls.push(row);
        }
    }

    for cluster_id in store.get_empty_cluster_ids()? {
        store.delete_cluster(cluster_id)?;
    }

    Ok(effects)
}

fn delete_url_internals(store: &HistoryStore, row: &UrlRow) -> Result<()> {
    store.delete_keyword_search_term_for_url(row.id)?;
    for segment_id in store.get_segments_for_url(row.id)? {
        store.delete_segment(segment_id)?;
    }
    store.delete_url_row(row.id)?;
    Ok(())
}

/// Removes the URLs and every visit to them, whether or not visits remain.
pub fn delete_urls(store: &HistoryStore, urls: &[String]) -> Result<DeletionEffects> {
    let mut visits = Vec::new();
    for url in urls {
        if let Some(row) = store.get_row_for_url(url)? {
            visits.extend(store.get_visits_for_url(row.id)?);
        }
    }
    let mut effects = delete_visits(store, &visits, &HashSet::new())?;

    // Rows without visits (bookmark stubs and the like) have no visit to
    // pull them through delete_visits.
    for url in urls {
        if let Some(row) = store.get_row_for_url(url)? {
            delete_url_internals(store, &row)?;
            effects.deleted_page_urls.push(row.url.clone());
            effects.deleted_rows.push(row);
        }
    }
    Ok(effects)
}

/// Deletes all visits in `[begin, end)`, restricted to `restrict_urls` when
/// non-empty.
pub fn expire_history_between(
    store: &HistoryStore,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    restrict_urls: &[String],
) -> Result<DeletionEffects> {
    let mut restrict_ids: HashSet<UrlId> = HashSet::new();
    for url in restrict_urls {
        if let Some(row) = store.get_row_for_url(url)? {
            restrict_ids.insert(row.id);
        }
    }

    let mut visits = store.get_visits_in_range(begin, end)?;
    if !restrict_urls.is_empty() {
        visits.retain(|v| restrict_ids.contains(&v.url_id));
    }
    delete_visits(store, &visits, &HashSet::new())
}

/// One bounded pass of age-based expiration: removes visits older than
/// `threshold`, at most `EXPIRATION_BATCH_SIZE` of them.
pub fn expire_old_history(
    store: &HistoryStore,
    threshold: DateTime<Utc>,
) -> Result<DeletionEffects> {
    let visits = store.get_visits_before(threshold, EXPIRATION_BATCH_SIZE)?;
    delete_visits(store, &visits, &HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::{CoreTransition, PageTransition, Qualifiers};
    use crate::types::VisitSource;
    use chrono::{Duration, TimeZone};

    fn visit_at(store: &HistoryStore, url: &str, t: DateTime<Utc>) -> VisitRow {
        let url_id = match store.get_row_for_url(url).unwrap() {
            Some(row) => row.id,
            None => store
                .add_url(&UrlRow {
                    url: url.to_string(),
                    visit_count: 0,
                    ..Default::default()
                })
                .unwrap(),
        };
        let mut visit = VisitRow::new(
            url_id,
            t,
            0,
            PageTransition::with(
                CoreTransition::Link,
                Qualifiers::CHAIN_START | Qualifiers::CHAIN_END,
            ),
        );
        store.add_visit(&mut visit, VisitSource::Browsed).unwrap();
        let mut row = store.get_url_row(url_id).unwrap().unwrap();
        row.visit_count += 1;
        row.last_visit = Some(t);
        store.update_url_row(&row).unwrap();
        visit
    }

    #[test]
    fn test_delete_visits_removes_orphaned_url() {
        let store = HistoryStore::open_in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        let visit = visit_at(&store, "https://a.com/", t);

        let effects =
            delete_visits(&store, &[visit], &HashSet::new()).unwrap();
        assert_eq!(effects.deleted_visit_ids.len(), 1);
        assert_eq!(effects.deleted_rows.len(), 1);
        assert!(store.get_row_for_url("https://a.com/").unwrap().is_none());
    }

    #[test]
    fn test_delete_visits_keeps_url_with_remaining_visits() {
        let store = HistoryStore::open_in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        let first = visit_at(&store, "https://a.com/", t);
        let _second = visit_at(&store, "https://a.com/", t + Duration::minutes(5));

        let effects = delete_visits(&store, &[first], &HashSet::new()).unwrap();
        assert!(effects.deleted_rows.is_empty());
        assert_eq!(effects.modified_urls.len(), 1);
        assert_eq!(effects.modified_urls[0].visit_count, 1);
        assert_eq!(
            effects.modified_urls[0].last_visit,
            Some(t + Duration::minutes(5))
        );
    }

    #[test]
    fn test_expire_old_history_only_touches_old_visits() {
        let store = HistoryStore::open_in_memory().unwrap();
        let old = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        visit_at(&store, "https://old.com/", old);
        visit_at(&store, "https://new.com/", recent);

        let threshold = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let effects = expire_old_history(&store, threshold).unwrap();
        assert_eq!(effects.deleted_visit_ids.len(), 1);
        assert!(store.get_row_for_url("https://old.com/").unwrap().is_none());
        assert!(store.get_row_for_url("https://new.com/").unwrap().is_some());
    }

    #[test]
    fn test_expire_history_between_respects_restrict_urls() {
        let store = HistoryStore::open_in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        visit_at(&store, "https://a.com/", t);
        visit_at(&store, "https://b.com/", t);

        let effects = expire_history_between(
            &store,
            None,
            None,
            &["https://a.com/".to_string()],
        )
        .unwrap();
        assert_eq!(effects.deleted_visit_ids.len(), 1);
        assert!(store.get_row_for_url("https://a.com/").unwrap().is_none());
        assert!(store.get_row_for_url("https://b.com/").unwrap().is_some());
    }
}
