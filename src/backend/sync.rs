//! Reconciliation of visits arriving from other devices.
//!
//! Foreign visits carry originator identity (cache guid plus the
//! originator's own visit id) and are written through the same store as
//! local ones. Bulk removal never scans the whole table in one shot: a
//! watermark below which foreign rows must go is persisted, and a queued
//! task deletes them in bounded batches until done.

use tracing::{debug, warn};

use super::{record_failure, HistoryBackend};
use crate::expire;
use crate::tasks::{BackendTask, QueuedTask, TaskStatus};
use crate::transition::CoreTransition;
use crate::types::{
    ContentAnnotations, ContextAnnotations, DeletionReason, UrlRow, VisitId, VisitRow,
    VisitSource, INVALID_VISIT_ID,
};

impl HistoryBackend {
    /// Inserts a visit received from sync. Returns the local visit id, or 0
    /// when the row is malformed or the store fails.
    pub fn add_synced_visit(
        &mut self,
        url: &str,
        title: &str,
        hidden: bool,
        mut visit: VisitRow,
        context_annotations: Option<ContextAnnotations>,
        content_annotations: Option<ContentAnnotations>,
    ) -> VisitId {
        if visit.id != INVALID_VISIT_ID
            || visit.originator_cache_guid.is_empty()
            || !visit.is_known_to_sync
        {
            warn!(url, "rejecting malformed synced visit");
            return INVALID_VISIT_ID;
        }
        let Some(store) = self.store.as_ref() else {
            return INVALID_VISIT_ID;
        };

        let outcome = (|| -> anyhow::Result<(UrlRow, VisitRow)> {
            let url_row = match store.get_row_for_url(url)? {
                Some(mut row) => {
                    if !visit.transition.core_type_is(CoreTransition::Reload) {
                        row.visit_count += 1;
                    }
                    if visit.incremented_omnibox_typed_score {
                        row.typed_count += 1;
                    }
                    if row.last_visit.map_or(true, |last| last < visit.visit_time) {
                        row.last_visit = Some(visit.visit_time);
                    }
                    if !title.is_empty() {
                        row.title = title.to_string();
                    }
                    if !hidden {
                        row.hidden = false;
                    }
                    store.update_url_row(&row)?;
                    row
                }
                None => {
                    let mut row = UrlRow {
                        id: 0,
                        url: url.to_string(),
                        title: title.to_string(),
                        visit_count: 1,
                        typed_count: if visit.incremented_omnibox_typed_score { 1 } else { 0 },
                        last_visit: Some(visit.visit_time),
                        hidden,
                    };
                    row.id = store.add_url(&row)?;
                    row
                }
            };
            visit.url_id = url_row.id;
            store.add_visit(&mut visit, VisitSource::Synced)?;
            store.set_may_contain_foreign_visits(true)?;
            if let Some(annotations) = context_annotations.as_ref() {
                store.set_context_annotations_for_visit(visit.id, annotations)?;
            }
            if let Some(annotations) = content_annotations.as_ref() {
                store.set_content_annotations_for_visit(visit.id, annotations)?;
            }
            Ok((url_row, visit.clone()))
        })();

        match outcome {
            Ok((url_row, visit_row)) => {
                if self.first_recorded_time.map_or(true, |t| visit_row.visit_time < t) {
                    self.first_recorded_time = Some(visit_row.visit_time);
                }
                if (self.foreign_segment_policy)(&visit_row) {
                    self.assign_segment_for_new_visit(
                        url,
                        visit_row.referring_visit,
                        visit_row.id,
                        visit_row.transition,
                        visit_row.visit_time,
                    );
                }
                self.delegate.notify_visit(&url_row, &visit_row, None);
                self.schedule_commit();
                visit_row.id
            }
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "add_synced_visit", &err);
                INVALID_VISIT_ID
            }
        }
    }

    /// Applies an updated version of a synced visit. The row is located by
    /// its timestamp; local identity fields (id, url binding, referrer and
    /// opener links) are preserved. Returns the local id, or 0 when the
    /// update does not apply.
    pub fn update_synced_visit(
        &mut self,
        updated: VisitRow,
        context_annotations: Option<ContextAnnotations>,
        content_annotations: Option<ContentAnnotations>,
    ) -> VisitId {
        if updated.originator_cache_guid.is_empty() || !updated.is_known_to_sync {
            warn!("rejecting malformed synced visit update");
            return INVALID_VISIT_ID;
        }
        let row = {
            let Some(store) = self.store.as_ref() else {
                return INVALID_VISIT_ID;
            };
            let outcome = (|| -> anyhow::Result<Option<VisitRow>> {
                let Some(original) = store.get_last_row_for_visit_by_time(updated.visit_time)?
                else {
                    return Ok(None);
                };
                if original.originator_cache_guid != updated.originator_cache_guid {
                    return Ok(None);
                }
                // A pending sweep will delete this row; resurrecting it
                // would race the watermark.
                if original.id <= store.get_delete_foreign_visits_until_id()? {
                    return Ok(None);
                }
                let mut row = updated.clone();
                row.id = original.id;
                row.url_id = original.url_id;
                row.referring_visit = original.referring_visit;
                row.opener_visit = original.opener_visit;
                row.segment_id = original.segment_id;
                store.update_visit_row(&row)?;
                if let Some(annotations) = context_annotations.as_ref() {
                    store.set_context_annotations_for_visit(row.id, annotations)?;
                }
                if let Some(annotations) = content_annotations.as_ref() {
                    store.set_content_annotations_for_visit(row.id, annotations)?;
                }
                Ok(Some(row))
            })();
            match outcome {
                Ok(Some(row)) => row,
                Ok(None) => {
                    debug!("synced visit update did not match a local row");
                    return INVALID_VISIT_ID;
                }
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "update_synced_visit", &err);
                    return INVALID_VISIT_ID;
                }
            }
        };
        self.update_segment_for_existing_foreign_visit(&row);
        self.delegate.notify_visit_updated(&row);
        self.schedule_commit();
        row.id
    }

    /// Rewrites the referrer/opener links of a visit once sync has resolved
    /// the originator ids to local ones.
    pub fn update_visit_referrer_opener_ids(
        &mut self,
        visit_id: VisitId,
        referrer_id: VisitId,
        opener_id: VisitId,
    ) {
        let row = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            let outcome = (|| -> anyhow::Result<Option<VisitRow>> {
                let Some(mut row) = store.get_row_for_visit(visit_id)? else {
                    return Ok(None);
                };
                row.referring_visit = referrer_id;
                row.opener_visit = opener_id;
                store.update_visit_row(&row)?;
                Ok(Some(row))
            })();
            match outcome {
                Ok(Some(row)) => row,
                Ok(None) => {
                    debug!(visit_id, "referrer update for unknown visit");
                    return;
                }
                Err(err) => {
                    record_failure(
                        &mut self.scheduled_kill_db,
                        "update_visit_referrer_opener_ids",
                        &err,
                    );
                    return;
                }
            }
        };
        // The resolved referrer can place the visit in a different segment.
        self.update_segment_for_existing_foreign_visit(&row);
        self.delegate.notify_visit_updated(&row);
        self.schedule_commit();
    }

    pub fn get_foreign_visit(
        &mut self,
        originator_cache_guid: &str,
        originator_visit_id: VisitId,
    ) -> Option<VisitRow> {
        let Some(store) = self.store.as_ref() else {
            return None;
        };
        match store.get_row_for_foreign_visit(originator_cache_guid, originator_visit_id) {
            Ok(row) => row,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_foreign_visit", &err);
                None
            }
        }
    }

    /// Starts removal of every foreign visit currently in the database and
    /// drops the known-to-sync marker from all rows. Deletion itself runs as
    /// a queued task in bounded batches; visits synced after this call (ids
    /// above the watermark) survive.
    pub fn delete_all_foreign_visits_and_reset_is_known_to_sync(&mut self) {
        let sweep_needed = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            let outcome = (|| -> anyhow::Result<bool> {
                store.set_all_visits_as_not_known_to_sync()?;
                store.delete_metadata("known_to_sync_visits_exist")?;
                if !store.may_contain_foreign_visits()? {
                    return Ok(false);
                }
                let watermark = store.get_max_visit_id_in_use()?;
                store.set_delete_foreign_visits_until_id(watermark)?;
                // New foreign visits arriving from here on are not covered
                // by this deletion.
                store.set_may_contain_foreign_visits(false)?;
                Ok(true)
            })();
            match outcome {
                Ok(needed) => needed,
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "delete_all_foreign_visits", &err);
                    return;
                }
            }
        };
        self.schedule_commit();
        if sweep_needed && !self.foreign_sweep_running {
            self.foreign_sweep_running = true;
            self.schedule_db_task(QueuedTask::new(Box::new(ForeignVisitSweepTask)));
        }
    }

    /// Re-queues an interrupted sweep after startup.
    pub(super) fn resume_foreign_visit_sweep(&mut self) {
        let pending = self
            .store
            .as_ref()
            .and_then(|store| store.get_delete_foreign_visits_until_id().ok())
            .unwrap_or(INVALID_VISIT_ID);
        if pending != INVALID_VISIT_ID && !self.foreign_sweep_running {
            self.foreign_sweep_running = true;
            self.schedule_db_task(QueuedTask::new(Box::new(ForeignVisitSweepTask)));
        }
    }
}

/// Deletes one batch of foreign visits at or below the persisted watermark
/// per run, reporting `NotDone` until the batch comes back short.
pub struct ForeignVisitSweepTask;

impl BackendTask for ForeignVisitSweepTask {
    fn run(&mut self, backend: &mut HistoryBackend) -> TaskStatus {
        let batch_size = backend.config.sync.foreign_visits_to_delete_per_batch;
        let (effects, done) = {
            let Some(store) = backend.store.as_ref() else {
                backend.foreign_sweep_running = false;
                return TaskStatus::Done;
            };
            let outcome = (|| -> anyhow::Result<(expire::DeletionEffects, bool)> {
                let watermark = store.get_delete_foreign_visits_until_id()?;
                if watermark == INVALID_VISIT_ID {
                    return Ok((expire::DeletionEffects::default(), true));
                }
                let visits = store.get_some_foreign_visits(watermark, batch_size)?;
                let done = visits.len() < batch_size;
                let effects =
                    expire::delete_visits(store, &visits, &std::collections::HashSet::new())?;
                if done {
                    store.delete_metadata("delete_foreign_visits_until_id")?;
                }
                Ok((effects, done))
            })();
            match outcome {
                Ok(result) => result,
                Err(err) => {
                    record_failure(&mut backend.scheduled_kill_db, "foreign_visit_sweep", &err);
                    backend.foreign_sweep_running = false;
                    return TaskStatus::Done;
                }
            }
        };
        if !effects.deleted_visit_ids.is_empty() || !effects.modified_urls.is_empty() {
            backend.finish_deletion(effects, DeletionReason::DeleteAllForeignVisits, false);
        }
        if done {
            backend.foreign_sweep_running = false;
            TaskStatus::Done
        } else {
            TaskStatus::NotDone
        }
    }
}
