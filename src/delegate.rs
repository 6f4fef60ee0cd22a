//! Outbound notifications from the engine.
//!
//! The embedder injects one `Delegate` at construction; the engine never
//! calls back into itself through it. Deletion notifications fire for every
//! deletion path, including expiration.

use chrono::{DateTime, Utc};

use crate::types::{DeletionInfo, UrlRow, VisitId, VisitRow};

pub trait Delegate {
    /// A visit finished being recorded. `local_navigation_id` is only set
    /// for local visits coming from a live navigation.
    fn notify_visit(&mut self, url_row: &UrlRow, visit_row: &VisitRow, local_navigation_id: Option<i64>);

    /// A URL row changed (title, counts) without a new visit.
    fn notify_url_modified(&mut self, url_row: &UrlRow);

    fn notify_deletions(&mut self, info: &DeletionInfo);

    /// One or more fields of an existing visit were updated in place.
    fn notify_visit_updated(&mut self, visit_row: &VisitRow);

    fn notify_visit_deleted(&mut self, visit_id: VisitId, visit_time: DateTime<Utc>);

    /// The database is damaged beyond repair; a raze has been scheduled.
    fn notify_profile_error(&mut self, message: &str);
}

/// Delegate that drops every notification. Used by the CLI and in tests
/// that do not assert on notifications.
#[derive(Debug, Default)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {
    fn notify_visit(&mut self, _: &UrlRow, _: &VisitRow, _: Option<i64>) {}
    fn notify_url_modified(&mut self, _: &UrlRow) {}
    fn notify_deletions(&mut self, _: &DeletionInfo) {}
    fn notify_visit_updated(&mut self, _: &VisitRow) {}
    fn notify_visit_deleted(&mut self, _: VisitId, _: DateTime<Utc>) {}
    fn notify_profile_error(&mut self, _: &str) {}
}
