//! History storage with SQLite.
//!
//! Single-connection store owning the urls/visits tables plus segments,
//! annotations, clusters, keyword search terms, downloads and the backend
//! metadata key/value table. The engine batches writes inside one
//! long-running transaction; see `begin_singleton_transaction`.

mod schema;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

use crate::transition::PageTransition;
use crate::types::{
    ContentAnnotations, ContextAnnotations, DownloadId, DownloadRow, InteractionState, KeywordId,
    KeywordSearchTermRow, KeywordSearchTermVisit, ModelCategory, OnVisitContext, PasswordState,
    SegmentId, UrlId, UrlRow, VisibleVisitCountToHost, VisitId, VisitRow, VisitSource, ClusterId,
    time_from_micros, time_to_micros, INVALID_SEGMENT_ID, INVALID_VISIT_ID,
};

pub use schema::SCHEMA;

/// Redirect qualifier bits, as stored in the `transition` column.
const SQL_REDIRECT_MASK: i64 = 0xC000_0000;

/// Visits that count as user-visible history entries: chain ends whose core
/// type is not a subframe load or a keyword-generated placeholder, on a
/// non-hidden URL. Matches `PageTransition::is_main_frame`.
const VISIBLE_VISIT_PREDICATE: &str =
    "(v.transition & 0x20000000) != 0 AND (v.transition & 0xff) NOT IN (3, 4, 10) AND u.hidden = 0";

const VISIT_COLUMNS: &str = "id, url_id, visit_time, referring_visit, external_referrer_url, \
     opener_visit, transition, segment_id, visit_duration, incremented_omnibox_typed_score, \
     originator_cache_guid, originator_visit_id, originator_referring_visit, \
     originator_opener_visit, is_known_to_sync, consider_for_most_visited";

/// One day of segment usage for a segment, used for most-visited scoring.
#[derive(Debug, Clone)]
pub struct SegmentUsageRow {
    pub segment_id: SegmentId,
    pub url_id: UrlId,
    pub time_slot: DateTime<Utc>,
    pub visit_count: i64,
}

pub struct HistoryStore {
    conn: Connection,
    path: Option<PathBuf>,
    in_transaction: bool,
}

/// True when the underlying SQLite error means the database file itself is
/// damaged and the only recovery is to raze and recreate it.
pub fn error_is_catastrophic(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
        ),
        _ => false,
    }
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
            in_transaction: false,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            path: None,
            in_transaction: false,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ============================================
    // SINGLETON TRANSACTION
    // ============================================

    // The engine keeps exactly one transaction open at all times and commits
    // it on a timer. rusqlite's scoped Transaction borrows the connection, so
    // the long-lived one is driven with raw BEGIN/COMMIT instead.

    pub fn begin_singleton_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit_singleton_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_singleton_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Drop every table and rebuild the schema. Used after catastrophic
    /// corruption; any open transaction must have been rolled back first.
    pub fn raze_and_reinit(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS urls;
             DROP TABLE IF EXISTS visits;
             DROP TABLE IF EXISTS segments;
             DROP TABLE IF EXISTS segment_usage;
             DROP TABLE IF EXISTS content_annotations;
             DROP TABLE IF EXISTS context_annotations;
             DROP TABLE IF EXISTS clusters;
             DROP TABLE IF EXISTS cluster_visits;
             DROP TABLE IF EXISTS cluster_visit_duplicates;
             DROP TABLE IF EXISTS keyword_search_terms;
             DROP TABLE IF EXISTS downloads;
             DROP TABLE IF EXISTS backend_metadata;
             VACUUM;",
        )?;
        self.init_schema()?;
        Ok(())
    }

    // ============================================
    // URLS
    // ============================================

    fn url_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UrlRow> {
        Ok(UrlRow {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            visit_count: row.get(3)?,
            typed_count: row.get(4)?,
            last_visit: row.get::<_, Option<i64>>(5)?.map(time_from_micros),
            hidden: row.get(6)?,
        })
    }

    pub fn get_row_for_url(&self, url: &str) -> Result<Option<UrlRow>> {
        let result = self.conn.query_row(
            "SELECT id, url, title, visit_count, typed_count, last_visit, hidden
             FROM urls WHERE url = ?",
            params![url],
            Self::url_from_row,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_url_row(&self, id: UrlId) -> Result<Option<UrlRow>> {
        let result = self.conn.query_row(
            "SELECT id, url, title, visit_count, typed_count, last_visit, hidden
             FROM urls WHERE id = ?",
            params![id],
            Self::url_from_row,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Inserts a fresh URL row; `row.id` is ignored and the assigned id
    /// returned.
    pub fn add_url(&self, row: &UrlRow) -> Result<UrlId> {
        self.conn.execute(
            "INSERT INTO urls (url, title, visit_count, typed_count, last_visit, hidden)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                row.url,
                row.title,
                row.visit_count,
                row.typed_count,
                row.last_visit.map(time_to_micros),
                row.hidden,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_url_row(&self, row: &UrlRow) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE urls SET url = ?, title = ?, visit_count = ?, typed_count = ?,
                 last_visit = ?, hidden = ?
             WHERE id = ?",
            params![
                row.url,
                row.title,
                row.visit_count,
                row.typed_count,
                row.last_visit.map(time_to_micros),
                row.hidden,
                row.id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_url_row(&self, id: UrlId) -> Result<()> {
        self.conn.execute("DELETE FROM urls WHERE id = ?", params![id])?;
        Ok(())
    }

    /// URL ids whose url or title contains every given lowercase term.
    pub fn get_text_matching_url_ids(&self, terms: &[String]) -> Result<Vec<UrlId>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let clause = terms
            .iter()
            .map(|_| "(instr(lower(url), ?) > 0 OR instr(lower(title), ?) > 0)")
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("SELECT id FROM urls WHERE {clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(terms.len() * 2);
        for term in terms {
            bound.push(term);
            bound.push(term);
        }
        let rows = stmt.query_map(&bound[..], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    // ============================================
    // VISITS
    // ============================================

    fn visit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VisitRow> {
        Ok(VisitRow {
            id: row.get(0)?,
            url_id: row.get(1)?,
            visit_time: time_from_micros(row.get(2)?),
            referring_visit: row.get(3)?,
            external_referrer_url: row.get(4)?,
            opener_visit: row.get(5)?,
            transition: PageTransition::from_i64(row.get(6)?),
            segment_id: row.get(7)?,
            visit_duration: Duration::microseconds(row.get(8)?),
            incremented_omnibox_typed_score: row.get(9)?,
            originator_cache_guid: row.get(10)?,
            originator_visit_id: row.get(11)?,
            originator_referring_visit: row.get(12)?,
            originator_opener_visit: row.get(13)?,
            is_known_to_sync: row.get(14)?,
            consider_for_most_visited: row.get(15)?,
        })
    }

    /// Inserts the visit, assigns `row.id`, and records its source.
    pub fn add_visit(&self, row: &mut VisitRow, source: VisitSource) -> Result<VisitId> {
        self.conn.execute(
            "INSERT INTO visits (url_id, visit_time, referring_visit, external_referrer_url,
                 opener_visit, transition, segment_id, visit_duration,
                 incremented_omnibox_typed_score, visit_source, originator_cache_guid,
                 originator_visit_id, originator_referring_visit, originator_opener_visit,
                 is_known_to_sync, consider_for_most_visited)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                row.url_id,
                time_to_micros(row.visit_time),
                row.referring_visit,
                row.external_referrer_url,
                row.opener_visit,
                row.transition.as_i64(),
                row.segment_id,
                row.visit_duration.num_microseconds().unwrap_or(0),
                row.incremented_omnibox_typed_score,
                source.as_i64(),
                row.originator_cache_guid,
                row.originator_visit_id,
                row.originator_referring_visit,
                row.originator_opener_visit,
                row.is_known_to_sync,
                row.consider_for_most_visited,
            ],
        )?;
        row.id = self.conn.last_insert_rowid();
        Ok(row.id)
    }

    pub fn get_row_for_visit(&self, id: VisitId) -> Result<Option<VisitRow>> {
        let sql = format!("SELECT {VISIT_COLUMNS} FROM visits WHERE id = ?");
        let result = self.conn.query_row(&sql, params![id], Self::visit_from_row);
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_visit_row(&self, row: &VisitRow) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE visits SET url_id = ?, visit_time = ?, referring_visit = ?,
                 external_referrer_url = ?, opener_visit = ?, transition = ?, segment_id = ?,
                 visit_duration = ?, incremented_omnibox_typed_score = ?,
                 originator_cache_guid = ?, originator_visit_id = ?,
                 originator_referring_visit = ?, originator_opener_visit = ?,
                 is_known_to_sync = ?, consider_for_most_visited = ?
             WHERE id = ?",
            params![
                row.url_id,
                time_to_micros(row.visit_time),
                row.referring_visit,
                row.external_referrer_url,
                row.opener_visit,
                row.transition.as_i64(),
                row.segment_id,
                row.visit_duration.num_microseconds().unwrap_or(0),
                row.incremented_omnibox_typed_score,
                row.originator_cache_guid,
                row.originator_visit_id,
                row.originator_referring_visit,
                row.originator_opener_visit,
                row.is_known_to_sync,
                row.consider_for_most_visited,
                row.id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_visit(&self, id: VisitId) -> Result<()> {
        // Clear forward links from later visits so chains never point at a
        // missing row.
        self.conn.execute(
            "UPDATE visits SET referring_visit = 0 WHERE referring_visit = ?",
            params![id],
        )?;
        self.conn.execute(
            "UPDATE visits SET opener_visit = 0 WHERE opener_visit = ?",
            params![id],
        )?;
        self.conn.execute("DELETE FROM visits WHERE id = ?", params![id])?;
        self.conn.execute(
            "DELETE FROM content_annotations WHERE visit_id = ?",
            params![id],
        )?;
        self.conn.execute(
            "DELETE FROM context_annotations WHERE visit_id = ?",
            params![id],
        )?;
        self.conn.execute(
            "DELETE FROM cluster_visits WHERE visit_id = ?",
            params![id],
        )?;
        self.conn.execute(
            "DELETE FROM cluster_visit_duplicates WHERE visit_id = ? OR duplicate_visit_id = ?",
            params![id, id],
        )?;
        Ok(())
    }

    pub fn get_visit_source(&self, id: VisitId) -> Result<VisitSource> {
        let result = self.conn.query_row(
            "SELECT visit_source FROM visits WHERE id = ?",
            params![id],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(v) => Ok(VisitSource::from_i64(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(VisitSource::Browsed),
            Err(e) => Err(e.into()),
        }
    }

    fn collect_visits(&self, sql: &str, bound: &[&dyn rusqlite::ToSql]) -> Result<Vec<VisitRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(bound, Self::visit_from_row)?;
        let mut visits = Vec::new();
        for row in rows {
            visits.push(row?);
        }
        Ok(visits)
    }

    /// All visits to a URL in ascending time order.
    pub fn get_visits_for_url(&self, url_id: UrlId) -> Result<Vec<VisitRow>> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits WHERE url_id = ? ORDER BY visit_time ASC, id ASC"
        );
        self.collect_visits(&sql, &[&url_id])
    }

    pub fn get_most_recent_visit_for_url(&self, url_id: UrlId) -> Result<Option<VisitRow>> {
        Ok(self.get_most_recent_visits_for_url(url_id, 1)?.into_iter().next())
    }

    pub fn get_most_recent_visits_for_url(
        &self,
        url_id: UrlId,
        max: usize,
    ) -> Result<Vec<VisitRow>> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits WHERE url_id = ?
             ORDER BY visit_time DESC, id DESC LIMIT ?"
        );
        self.collect_visits(&sql, &[&url_id, &(max as i64)])
    }

    /// Latest-inserted visit at exactly this timestamp. Used to locate the
    /// prior visit of a client-redirect chain being extended.
    pub fn get_last_row_for_visit_by_time(&self, t: DateTime<Utc>) -> Result<Option<VisitRow>> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits WHERE visit_time = ?
             ORDER BY id DESC LIMIT 1"
        );
        let result = self
            .conn
            .query_row(&sql, params![time_to_micros(t)], Self::visit_from_row);
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_row_for_foreign_visit(
        &self,
        originator_cache_guid: &str,
        originator_visit_id: VisitId,
    ) -> Result<Option<VisitRow>> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits
             WHERE originator_cache_guid = ? AND originator_visit_id = ?"
        );
        let result = self.conn.query_row(
            &sql,
            params![originator_cache_guid, originator_visit_id],
            Self::visit_from_row,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_max_visit_id_in_use(&self) -> Result<VisitId> {
        let id: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM visits", [], |row| row.get(0))?;
        Ok(id.unwrap_or(INVALID_VISIT_ID))
    }

    /// A batch of foreign visits with id at or below the watermark, oldest
    /// ids first.
    pub fn get_some_foreign_visits(
        &self,
        max_visit_id: VisitId,
        limit: usize,
    ) -> Result<Vec<VisitRow>> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits
             WHERE originator_cache_guid != '' AND id <= ?
             ORDER BY id ASC LIMIT ?"
        );
        self.collect_visits(&sql, &[&max_visit_id, &(limit as i64)])
    }

    pub fn set_all_visits_as_not_known_to_sync(&self) -> Result<()> {
        self.conn
            .execute("UPDATE visits SET is_known_to_sync = 0", [])?;
        Ok(())
    }

    /// User-visible visits between `begin` (inclusive) and `end` (exclusive),
    /// newest first. `max = 0` means unlimited.
    pub fn get_visible_visits_in_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        max: usize,
    ) -> Result<Vec<VisitRow>> {
        let begin_us = begin.map(time_to_micros).unwrap_or(i64::MIN);
        let end_us = end.map(time_to_micros).unwrap_or(i64::MAX);
        let limit = if max == 0 { i64::MAX } else { max as i64 };
        let sql = format!(
            "SELECT {cols} FROM visits v JOIN urls u ON v.url_id = u.id
             WHERE v.visit_time >= ? AND v.visit_time < ? AND {pred}
             ORDER BY v.visit_time DESC, v.id DESC LIMIT ?",
            cols = VISIT_COLUMNS
                .split(", ")
                .map(|c| format!("v.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            pred = VISIBLE_VISIT_PREDICATE,
        );
        self.collect_visits(&sql, &[&begin_us, &end_us, &limit])
    }

    /// Visits strictly before `end`, oldest first. Drives expiration.
    pub fn get_visits_before(&self, end: DateTime<Utc>, max: usize) -> Result<Vec<VisitRow>> {
        let limit = if max == 0 { i64::MAX } else { max as i64 };
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits WHERE visit_time < ?
             ORDER BY visit_time ASC, id ASC LIMIT ?"
        );
        self.collect_visits(&sql, &[&time_to_micros(end), &limit])
    }

    pub fn get_visits_in_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<VisitRow>> {
        let begin_us = begin.map(time_to_micros).unwrap_or(i64::MIN);
        let end_us = end.map(time_to_micros).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM visits
             WHERE visit_time >= ? AND visit_time < ?
             ORDER BY visit_time ASC, id ASC"
        );
        self.collect_visits(&sql, &[&begin_us, &end_us])
    }

    /// The visit a redirect continued into, if any.
    pub fn get_redirect_from_visit(&self, from_visit: VisitId) -> Result<Option<(VisitId, String)>> {
        let result = self.conn.query_row(
            "SELECT v.id, u.url FROM visits v JOIN urls u ON v.url_id = u.id
             WHERE v.referring_visit = ? AND (v.transition & ?) != 0",
            params![from_visit, SQL_REDIRECT_MASK],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The visit a redirect arrived from, if this visit is itself a redirect.
    pub fn get_redirect_to_visit(&self, to_visit: VisitId) -> Result<Option<(VisitId, String)>> {
        let row = match self.get_row_for_visit(to_visit)? {
            Some(row) if row.transition.is_redirect() && row.referring_visit != INVALID_VISIT_ID => {
                row
            }
            _ => return Ok(None),
        };
        let result = self.conn.query_row(
            "SELECT v.id, u.url FROM visits v JOIN urls u ON v.url_id = u.id WHERE v.id = ?",
            params![row.referring_visit],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn count_visits_for_url(&self, url_id: UrlId) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM visits WHERE url_id = ?",
            params![url_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Recomputed (visit_count, typed_count, last_visit) from the visits that
    /// remain after deletions.
    pub fn recompute_url_counts(
        &self,
        url_id: UrlId,
    ) -> Result<(i32, i32, Option<DateTime<Utc>>)> {
        let (visits, typed, last): (i64, i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN incremented_omnibox_typed_score THEN 1 ELSE 0 END),
                    MAX(visit_time)
             FROM visits WHERE url_id = ?",
            params![url_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get(2)?,
                ))
            },
        )?;
        Ok((visits as i32, typed as i32, last.map(time_from_micros)))
    }

    pub fn get_first_recorded_visit_time(&self) -> Result<Option<DateTime<Utc>>> {
        let t: Option<i64> = self
            .conn
            .query_row("SELECT MIN(visit_time) FROM visits", [], |row| row.get(0))?;
        Ok(t.map(time_from_micros))
    }

    // ============================================
    // VISIT COUNTS & HOST QUERIES
    // ============================================

    /// Count of unique (URL, day) pairs among visible visits in the range.
    pub fn get_history_count(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        const DAY_US: i64 = 24 * 60 * 60 * 1_000_000;
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM (
                     SELECT DISTINCT v.url_id, v.visit_time / {DAY_US} AS day
                     FROM visits v JOIN urls u ON v.url_id = u.id
                     WHERE v.visit_time >= ? AND v.visit_time < ? AND {VISIBLE_VISIT_PREDICATE}
                 )"
            ),
            params![time_to_micros(begin), time_to_micros(end)],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Distinct URL strings with a visible visit in the range, optionally
    /// restricted to locally originated visits.
    pub fn get_urls_visited_in_range(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        local_only: bool,
    ) -> Result<Vec<String>> {
        let local = if local_only {
            " AND v.originator_cache_guid = ''"
        } else {
            ""
        };
        let sql = format!(
            "SELECT DISTINCT u.url FROM visits v JOIN urls u ON v.url_id = u.id
             WHERE v.visit_time >= ? AND v.visit_time < ? AND {VISIBLE_VISIT_PREDICATE}{local}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![time_to_micros(begin), time_to_micros(end)],
            |row| row.get(0),
        )?;
        let mut urls = Vec::new();
        for url in rows {
            urls.push(url?);
        }
        Ok(urls)
    }

    /// Most recent visit to any URL matching one of the given prefixes
    /// within the range. Prefixes end at the path separator, so
    /// `https://host/` matches every page on the host.
    pub fn get_last_visit_to_url_prefixes(
        &self,
        prefixes: &[String],
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        if prefixes.is_empty() {
            return Ok(None);
        }
        let begin_us = begin.map(time_to_micros).unwrap_or(i64::MIN);
        let end_us = end.map(time_to_micros).unwrap_or(i64::MAX);
        let clause = prefixes
            .iter()
            .map(|_| "(u.url >= ? AND u.url < ?)")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT MAX(v.visit_time) FROM visits v JOIN urls u ON v.url_id = u.id
             WHERE v.visit_time >= ? AND v.visit_time < ? AND ({clause})"
        );
        // [prefix, prefix + U+10FFFF) covers every string starting with it.
        let mut uppers = Vec::with_capacity(prefixes.len());
        for p in prefixes {
            let mut upper = p.clone();
            upper.push('\u{10FFFF}');
            uppers.push(upper);
        }
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&begin_us, &end_us];
        for (p, upper) in prefixes.iter().zip(uppers.iter()) {
            bound.push(p);
            bound.push(upper);
        }
        let t: Option<i64> = self
            .conn
            .query_row(&sql, &bound[..], |row| row.get(0))?;
        Ok(t.map(time_from_micros))
    }

    pub fn get_last_visit_to_url(
        &self,
        url: &str,
        end: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let end_us = end.map(time_to_micros).unwrap_or(i64::MAX);
        let t: Option<i64> = self.conn.query_row(
            "SELECT MAX(v.visit_time) FROM visits v JOIN urls u ON v.url_id = u.id
             WHERE u.url = ? AND v.visit_time < ?",
            params![url, end_us],
            |row| row.get(0),
        )?;
        Ok(t.map(time_from_micros))
    }

    pub fn get_visible_visit_count_to_url_prefixes(
        &self,
        prefixes: &[String],
    ) -> Result<VisibleVisitCountToHost> {
        if prefixes.is_empty() {
            return Ok(VisibleVisitCountToHost {
                count: 0,
                first_visit: None,
            });
        }
        let clause = prefixes
            .iter()
            .map(|_| "(u.url >= ? AND u.url < ?)")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT COUNT(*), MIN(v.visit_time)
             FROM visits v JOIN urls u ON v.url_id = u.id
             WHERE ({clause}) AND {VISIBLE_VISIT_PREDICATE}"
        );
        let mut uppers = Vec::with_capacity(prefixes.len());
        for p in prefixes {
            let mut upper = p.clone();
            upper.push('\u{10FFFF}');
            uppers.push(upper);
        }
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for (p, upper) in prefixes.iter().zip(uppers.iter()) {
            bound.push(p);
            bound.push(upper);
        }
        let (count, first): (i64, Option<i64>) = self
            .conn
            .query_row(&sql, &bound[..], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(VisibleVisitCountToHost {
            count,
            first_visit: first.map(time_from_micros),
        })
    }

    /// Whether any stored URL under one of the prefixes has typed credit.
    /// Backs the untyped-intranet-host upgrade check.
    pub fn has_typed_urls_with_prefixes(&self, prefixes: &[String]) -> Result<bool> {
        if prefixes.is_empty() {
            return Ok(false);
        }
        let clause = prefixes
            .iter()
            .map(|_| "(url >= ? AND url < ?)")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!("SELECT 1 FROM urls WHERE typed_count > 0 AND ({clause}) LIMIT 1");
        let mut uppers = Vec::with_capacity(prefixes.len());
        for p in prefixes {
            let mut upper = p.clone();
            upper.push('\u{10FFFF}');
            uppers.push(upper);
        }
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for (p, upper) in prefixes.iter().zip(uppers.iter()) {
            bound.push(p);
            bound.push(upper);
        }
        let result = self.conn.query_row(&sql, &bound[..], |_| Ok(()));
        match result {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Visit count and most recent visit time across all URLs under the
    /// prefixes. Used for per-origin counts.
    pub fn get_count_and_last_visit_for_prefixes(
        &self,
        prefixes: &[String],
    ) -> Result<(i64, Option<DateTime<Utc>>)> {
        if prefixes.is_empty() {
            return Ok((0, None));
        }
        let clause = prefixes
            .iter()
            .map(|_| "(u.url >= ? AND u.url < ?)")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT COUNT(*), MAX(v.visit_time)
             FROM visits v JOIN urls u ON v.url_id = u.id WHERE {clause}"
        );
        let mut uppers = Vec::with_capacity(prefixes.len());
        for p in prefixes {
            let mut upper = p.clone();
            upper.push('\u{10FFFF}');
            uppers.push(upper);
        }
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for (p, upper) in prefixes.iter().zip(uppers.iter()) {
            bound.push(p);
            bound.push(upper);
        }
        let (count, last): (i64, Option<i64>) = self
            .conn
            .query_row(&sql, &bound[..], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok((count, last.map(time_from_micros)))
    }

    // ============================================
    // SEGMENTS
    // ============================================

    pub fn get_segment_named(&self, name: &str) -> Result<Option<SegmentId>> {
        let result = self.conn.query_row(
            "SELECT id FROM segments WHERE name = ?",
            params![name],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_segment(&self, name: &str, url_id: UrlId) -> Result<SegmentId> {
        self.conn.execute(
            "INSERT INTO segments (name, url_id) VALUES (?, ?)",
            params![name, url_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_segment_url_id(&self, segment_id: SegmentId) -> Result<Option<UrlId>> {
        let result = self.conn.query_row(
            "SELECT url_id FROM segments WHERE id = ?",
            params![segment_id],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_segment_representation_url(
        &self,
        segment_id: SegmentId,
        url_id: UrlId,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE segments SET url_id = ? WHERE id = ?",
            params![url_id, segment_id],
        )?;
        Ok(())
    }

    pub fn set_segment_id_for_visit(&self, visit_id: VisitId, segment_id: SegmentId) -> Result<()> {
        self.conn.execute(
            "UPDATE visits SET segment_id = ? WHERE id = ?",
            params![segment_id, visit_id],
        )?;
        Ok(())
    }

    /// Adds `amount` (possibly negative) to the segment's usage counter for
    /// the day bucket. Buckets that drop to zero or below are removed.
    pub fn update_segment_visit_count(
        &self,
        segment_id: SegmentId,
        time_slot: DateTime<Utc>,
        amount: i64,
    ) -> Result<()> {
        let slot = time_to_micros(time_slot);
        self.conn.execute(
            "INSERT INTO segment_usage (segment_id, time_slot, visit_count)
             VALUES (?, ?, ?)
             ON CONFLICT(segment_id, time_slot)
             DO UPDATE SET visit_count = visit_count + excluded.visit_count",
            params![segment_id, slot, amount],
        )?;
        self.conn.execute(
            "DELETE FROM segment_usage
             WHERE segment_id = ? AND time_slot = ? AND visit_count <= 0",
            params![segment_id, slot],
        )?;
        Ok(())
    }

    /// Raw per-day usage since `from_time`; scoring happens in the engine.
    pub fn get_segment_usage_since(&self, from_time: DateTime<Utc>) -> Result<Vec<SegmentUsageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT su.segment_id, s.url_id, su.time_slot, su.visit_count
             FROM segment_usage su JOIN segments s ON su.segment_id = s.id
             WHERE su.time_slot >= ?
             ORDER BY su.segment_id ASC, su.time_slot ASC",
        )?;
        let rows = stmt.query_map(params![time_to_micros(from_time)], |row| {
            Ok(SegmentUsageRow {
                segment_id: row.get(0)?,
                url_id: row.get(1)?,
                time_slot: time_from_micros(row.get(2)?),
                visit_count: row.get(3)?,
            })
        })?;
        let mut usage = Vec::new();
        for row in rows {
            usage.push(row?);
        }
        Ok(usage)
    }

    pub fn delete_segment(&self, segment_id: SegmentId) -> Result<()> {
        self.conn.execute(
            "UPDATE visits SET segment_id = ? WHERE segment_id = ?",
            params![INVALID_SEGMENT_ID, segment_id],
        )?;
        self.conn.execute(
            "DELETE FROM segment_usage WHERE segment_id = ?",
            params![segment_id],
        )?;
        self.conn
            .execute("DELETE FROM segments WHERE id = ?", params![segment_id])?;
        Ok(())
    }

    /// Segments whose representative URL is being deleted.
    pub fn get_segments_for_url(&self, url_id: UrlId) -> Result<Vec<SegmentId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM segments WHERE url_id = ?")?;
        let rows = stmt.query_map(params![url_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    // ============================================
    // ANNOTATIONS
    // ============================================

    pub fn set_content_annotations_for_visit(
        &self,
        visit_id: VisitId,
        annotations: &ContentAnnotations,
    ) -> Result<()> {
        let categories = serde_json::to_string(&annotations.categories)?;
        let related = serde_json::to_string(&annotations.related_searches)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO content_annotations
                 (visit_id, page_language, password_state, visibility_score, model_version,
                  categories, related_searches, alternative_title, browsing_topics_eligible)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                visit_id,
                annotations.page_language,
                annotations.password_state.as_i64(),
                annotations.visibility_score,
                annotations.model_version,
                categories,
                related,
                annotations.alternative_title,
                annotations.browsing_topics_eligible,
            ],
        )?;
        Ok(())
    }

    pub fn get_content_annotations_for_visit(
        &self,
        visit_id: VisitId,
    ) -> Result<Option<ContentAnnotations>> {
        let result = self.conn.query_row(
            "SELECT page_language, password_state, visibility_score, model_version,
                    categories, related_searches, alternative_title, browsing_topics_eligible
             FROM content_annotations WHERE visit_id = ?",
            params![visit_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            },
        );
        let (lang, pw, score, model, categories, related, alt_title, topics) = match result {
            Ok(t) => t,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let categories: Vec<ModelCategory> =
            serde_json::from_str(&categories).unwrap_or_default();
        let related_searches: Vec<String> = serde_json::from_str(&related).unwrap_or_default();
        Ok(Some(ContentAnnotations {
            page_language: lang,
            password_state: PasswordState::from_i64(pw),
            visibility_score: score,
            model_version: model,
            categories,
            related_searches,
            alternative_title: alt_title,
            browsing_topics_eligible: topics,
        }))
    }

    pub fn set_context_annotations_for_visit(
        &self,
        visit_id: VisitId,
        annotations: &ContextAnnotations,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO context_annotations
                 (visit_id, window_id, tab_id, response_code, omnibox_url_copied,
                  is_existing_bookmark, is_new_bookmark, total_foreground_duration)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                visit_id,
                annotations.on_visit.window_id,
                annotations.on_visit.tab_id,
                annotations.on_visit.response_code,
                annotations.omnibox_url_copied,
                annotations.is_existing_bookmark,
                annotations.is_new_bookmark,
                annotations
                    .total_foreground_duration
                    .num_microseconds()
                    .unwrap_or(0),
            ],
        )?;
        Ok(())
    }

    pub fn get_context_annotations_for_visit(
        &self,
        visit_id: VisitId,
    ) -> Result<Option<ContextAnnotations>> {
        let result = self.conn.query_row(
            "SELECT window_id, tab_id, response_code, omnibox_url_copied,
                    is_existing_bookmark, is_new_bookmark, total_foreground_duration
             FROM context_annotations WHERE visit_id = ?",
            params![visit_id],
            |row| {
                Ok(ContextAnnotations {
                    on_visit: OnVisitContext {
                        window_id: row.get(0)?,
                        tab_id: row.get(1)?,
                        response_code: row.get(2)?,
                    },
                    omnibox_url_copied: row.get(3)?,
                    is_existing_bookmark: row.get(4)?,
                    is_new_bookmark: row.get(5)?,
                    total_foreground_duration: Duration::microseconds(row.get(6)?),
                })
            },
        );
        match result {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ============================================
    // CLUSTERS
    // ============================================

    pub fn add_cluster(
        &self,
        keywords: &[String],
        originator_cache_guid: &str,
        originator_cluster_id: ClusterId,
    ) -> Result<ClusterId> {
        let keywords = serde_json::to_string(keywords)?;
        self.conn.execute(
            "INSERT INTO clusters (keywords, originator_cache_guid, originator_cluster_id)
             VALUES (?, ?, ?)",
            params![keywords, originator_cache_guid, originator_cluster_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_visit_to_cluster(
        &self,
        cluster_id: ClusterId,
        visit_id: VisitId,
        score: f64,
        state: InteractionState,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cluster_visits (cluster_id, visit_id, score, interaction_state)
             VALUES (?, ?, ?, ?)",
            params![cluster_id, visit_id, score, state.as_i64()],
        )?;
        Ok(())
    }

    pub fn add_cluster_visit_duplicate(
        &self,
        visit_id: VisitId,
        duplicate_visit_id: VisitId,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO cluster_visit_duplicates (visit_id, duplicate_visit_id)
             VALUES (?, ?)",
            params![visit_id, duplicate_visit_id],
        )?;
        Ok(())
    }

    pub fn get_cluster_row(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Option<(Vec<String>, String, ClusterId)>> {
        let result = self.conn.query_row(
            "SELECT keywords, originator_cache_guid, originator_cluster_id
             FROM clusters WHERE id = ?",
            params![cluster_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        );
        match result {
            Ok((keywords, guid, orig_id)) => {
                let keywords: Vec<String> = serde_json::from_str(&keywords).unwrap_or_default();
                Ok(Some((keywords, guid, orig_id)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// (visit_id, score, interaction_state) for every visit in the cluster,
    /// highest score first.
    pub fn get_visits_in_cluster(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Vec<(VisitId, f64, InteractionState)>> {
        let mut stmt = self.conn.prepare(
            "SELECT visit_id, score, interaction_state FROM cluster_visits
             WHERE cluster_id = ? ORDER BY score DESC",
        )?;
        let rows = stmt.query_map(params![cluster_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                InteractionState::from_i64(row.get::<_, i64>(2)?),
            ))
        })?;
        let mut visits = Vec::new();
        for row in rows {
            visits.push(row?);
        }
        Ok(visits)
    }

    pub fn get_duplicate_visit_ids(&self, visit_id: VisitId) -> Result<Vec<VisitId>> {
        let mut stmt = self.conn.prepare(
            "SELECT duplicate_visit_id FROM cluster_visit_duplicates WHERE visit_id = ?",
        )?;
        let rows = stmt.query_map(params![visit_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Cluster ids whose most recent visit falls in the range, newest
    /// cluster first.
    pub fn get_most_recent_cluster_ids(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<ClusterId>> {
        let limit = if max == 0 { i64::MAX } else { max as i64 };
        let mut stmt = self.conn.prepare(
            "SELECT cv.cluster_id, MAX(v.visit_time) AS latest
             FROM cluster_visits cv JOIN visits v ON cv.visit_id = v.id
             GROUP BY cv.cluster_id
             HAVING latest >= ? AND latest < ?
             ORDER BY latest DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(
            params![time_to_micros(begin), time_to_micros(end), limit],
            |row| row.get(0),
        )?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    pub fn get_cluster_id_containing_visit(&self, visit_id: VisitId) -> Result<Option<ClusterId>> {
        let result = self.conn.query_row(
            "SELECT cluster_id FROM cluster_visits WHERE visit_id = ?",
            params![visit_id],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_cluster_visit_interaction_state(
        &self,
        visit_id: VisitId,
        state: InteractionState,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE cluster_visits SET interaction_state = ? WHERE visit_id = ?",
            params![state.as_i64(), visit_id],
        )?;
        Ok(())
    }

    pub fn delete_cluster(&self, cluster_id: ClusterId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM cluster_visit_duplicates WHERE visit_id IN
                 (SELECT visit_id FROM cluster_visits WHERE cluster_id = ?)",
            params![cluster_id],
        )?;
        self.conn.execute(
            "DELETE FROM cluster_visits WHERE cluster_id = ?",
            params![cluster_id],
        )?;
        self.conn
            .execute("DELETE FROM clusters WHERE id = ?", params![cluster_id])?;
        Ok(())
    }

    /// Clusters left with no visits after membership cleanup.
    pub fn get_empty_cluster_ids(&self) -> Result<Vec<ClusterId>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id FROM clusters c
             LEFT JOIN cluster_visits cv ON cv.cluster_id = c.id
             WHERE cv.visit_id IS NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    // ============================================
    // KEYWORD SEARCH TERMS
    // ============================================

    pub fn set_keyword_search_term(
        &self,
        url_id: UrlId,
        keyword_id: KeywordId,
        term: &str,
    ) -> Result<()> {
        let normalized = normalize_search_term(term);
        self.conn.execute(
            "INSERT OR REPLACE INTO keyword_search_terms
                 (keyword_id, url_id, term, normalized_term)
             VALUES (?, ?, ?, ?)",
            params![keyword_id, url_id, term, normalized],
        )?;
        Ok(())
    }

    pub fn get_keyword_search_term_row(&self, url_id: UrlId) -> Result<Option<KeywordSearchTermRow>> {
        let result = self.conn.query_row(
            "SELECT keyword_id, url_id, term, normalized_term
             FROM keyword_search_terms WHERE url_id = ?",
            params![url_id],
            |row| {
                Ok(KeywordSearchTermRow {
                    keyword_id: row.get(0)?,
                    url_id: row.get(1)?,
                    term: row.get(2)?,
                    normalized_term: row.get(3)?,
                })
            },
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_keyword_search_term_for_url(&self, url_id: UrlId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM keyword_search_terms WHERE url_id = ?",
            params![url_id],
        )?;
        Ok(())
    }

    pub fn delete_all_search_terms_for_keyword(&self, keyword_id: KeywordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM keyword_search_terms WHERE keyword_id = ?",
            params![keyword_id],
        )?;
        Ok(())
    }

    pub fn delete_keyword_search_term(&self, term: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM keyword_search_terms WHERE normalized_term = ?",
            params![normalize_search_term(term)],
        )?;
        Ok(())
    }

    /// URLs that carry the given term for the keyword, matched on the
    /// normalized form.
    pub fn get_urls_for_keyword_term(
        &self,
        keyword_id: KeywordId,
        term: &str,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.url FROM keyword_search_terms k JOIN urls u ON k.url_id = u.id
             WHERE k.keyword_id = ? AND k.normalized_term = ?",
        )?;
        let rows = stmt.query_map(params![keyword_id, normalize_search_term(term)], |row| {
            row.get(0)
        })?;
        let mut urls = Vec::new();
        for row in rows {
            urls.push(row?);
        }
        Ok(urls)
    }

    /// Terms for the keyword whose normalized form starts with the prefix,
    /// most recently visited first.
    pub fn get_most_recent_keyword_search_terms(
        &self,
        keyword_id: KeywordId,
        prefix: &str,
        max: usize,
    ) -> Result<Vec<KeywordSearchTermVisit>> {
        let limit = if max == 0 { i64::MAX } else { max as i64 };
        let mut pattern = normalize_search_term(prefix);
        pattern.push('%');
        let mut stmt = self.conn.prepare(
            "SELECT k.term, u.visit_count, u.last_visit
             FROM keyword_search_terms k JOIN urls u ON k.url_id = u.id
             WHERE k.keyword_id = ? AND k.normalized_term LIKE ?
             ORDER BY u.last_visit DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![keyword_id, pattern, limit], |row| {
            Ok(KeywordSearchTermVisit {
                term: row.get(0)?,
                visit_count: row.get(1)?,
                last_visit_time: time_from_micros(row.get::<_, Option<i64>>(2)?.unwrap_or(0)),
            })
        })?;
        let mut visits = Vec::new();
        for row in rows {
            visits.push(row?);
        }
        Ok(visits)
    }

    // ============================================
    // DOWNLOADS
    // ============================================

    fn download_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRow> {
        Ok(DownloadRow {
            id: row.get(0)?,
            guid: row.get(1)?,
            url: row.get(2)?,
            target_path: row.get(3)?,
            start_time: time_from_micros(row.get(4)?),
            end_time: row.get::<_, Option<i64>>(5)?.map(time_from_micros),
            received_bytes: row.get(6)?,
            total_bytes: row.get(7)?,
            state: row.get(8)?,
            opened: row.get(9)?,
        })
    }

    pub fn create_download(&self, row: &DownloadRow) -> Result<DownloadId> {
        self.conn.execute(
            "INSERT INTO downloads (guid, url, target_path, start_time, end_time,
                 received_bytes, total_bytes, state, opened)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                row.guid,
                row.url,
                row.target_path,
                time_to_micros(row.start_time),
                row.end_time.map(time_to_micros),
                row.received_bytes,
                row.total_bytes,
                row.state,
                row.opened,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_downloads(&self) -> Result<Vec<DownloadRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, guid, url, target_path, start_time, end_time,
                    received_bytes, total_bytes, state, opened
             FROM downloads ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map([], Self::download_from_row)?;
        let mut downloads = Vec::new();
        for row in rows {
            downloads.push(row?);
        }
        Ok(downloads)
    }

    pub fn update_download(&self, row: &DownloadRow) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE downloads SET guid = ?, url = ?, target_path = ?, start_time = ?,
                 end_time = ?, received_bytes = ?, total_bytes = ?, state = ?, opened = ?
             WHERE id = ?",
            params![
                row.guid,
                row.url,
                row.target_path,
                time_to_micros(row.start_time),
                row.end_time.map(time_to_micros),
                row.received_bytes,
                row.total_bytes,
                row.state,
                row.opened,
                row.id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_downloads(&self, ids: &[DownloadId]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            removed += self
                .conn
                .execute("DELETE FROM downloads WHERE id = ?", params![id])?;
        }
        Ok(removed)
    }

    pub fn get_next_download_id(&self) -> Result<DownloadId> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM downloads", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) + 1)
    }

    // ============================================
    // BACKEND METADATA
    // ============================================

    pub fn get_metadata(&self, key: &str) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT value FROM backend_metadata WHERE key = ?",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_metadata(&self, key: &str, value: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO backend_metadata (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_metadata(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM backend_metadata WHERE key = ?", params![key])?;
        Ok(())
    }

    pub fn get_delete_foreign_visits_until_id(&self) -> Result<VisitId> {
        Ok(self
            .get_metadata("delete_foreign_visits_until_id")?
            .unwrap_or(INVALID_VISIT_ID))
    }

    pub fn set_delete_foreign_visits_until_id(&self, id: VisitId) -> Result<()> {
        self.set_metadata("delete_foreign_visits_until_id", id)
    }

    pub fn may_contain_foreign_visits(&self) -> Result<bool> {
        Ok(self.get_metadata("may_contain_foreign_visits")?.unwrap_or(0) != 0)
    }

    pub fn set_may_contain_foreign_visits(&self, value: bool) -> Result<()> {
        self.set_metadata("may_contain_foreign_visits", value as i64)
    }

    // ============================================
    // BULK DELETION
    // ============================================

    /// Clears every table except downloads. Used by delete-all-history.
    pub fn clear_history_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM visits;
             DELETE FROM urls;
             DELETE FROM segments;
             DELETE FROM segment_usage;
             DELETE FROM content_annotations;
             DELETE FROM context_annotations;
             DELETE FROM clusters;
             DELETE FROM cluster_visits;
             DELETE FROM cluster_visit_duplicates;
             DELETE FROM keyword_search_terms;",
        )?;
        Ok(())
    }
}

/// Lowercased, whitespace-collapsed form used for prefix matching and
/// term-based deletion.
pub fn normalize_search_term(term: &str) -> String {
    term.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::{CoreTransition, Qualifiers};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_url_round_trip() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut row = UrlRow {
            id: 0,
            url: "https://example.com/".to_string(),
            title: "Example".to_string(),
            visit_count: 3,
            typed_count: 1,
            last_visit: Some(at(12, 0)),
            hidden: false,
        };
        row.id = store.add_url(&row).unwrap();
        assert!(row.id > 0);

        let loaded = store.get_row_for_url("https://example.com/").unwrap().unwrap();
        assert_eq!(loaded, row);
        assert_eq!(store.get_url_row(row.id).unwrap().unwrap(), row);
        assert!(store.get_row_for_url("https://other.com/").unwrap().is_none());
    }

    #[test]
    fn test_visit_round_trip_and_foreign_lookup() {
        let store = HistoryStore::open_in_memory().unwrap();
        let url_id = store
            .add_url(&UrlRow {
                url: "https://example.com/".to_string(),
                ..Default::default()
            })
            .unwrap();

        let transition = PageTransition::with(
            CoreTransition::Typed,
            Qualifiers::CHAIN_START | Qualifiers::CHAIN_END,
        );
        let mut visit = VisitRow::new(url_id, at(9, 30), 0, transition);
        visit.originator_cache_guid = "device-a".to_string();
        visit.originator_visit_id = 42;
        store.add_visit(&mut visit, VisitSource::Synced).unwrap();

        let loaded = store.get_row_for_visit(visit.id).unwrap().unwrap();
        assert_eq!(loaded, visit);
        assert_eq!(store.get_visit_source(visit.id).unwrap(), VisitSource::Synced);

        let foreign = store
            .get_row_for_foreign_visit("device-a", 42)
            .unwrap()
            .unwrap();
        assert_eq!(foreign.id, visit.id);
        assert!(store
            .get_row_for_foreign_visit("device-b", 42)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_visible_visits_exclude_hidden_and_subframes() {
        let store = HistoryStore::open_in_memory().unwrap();
        let visible_url = store
            .add_url(&UrlRow {
                url: "https://a.com/".to_string(),
                ..Default::default()
            })
            .unwrap();
        let hidden_url = store
            .add_url(&UrlRow {
                url: "https://b.com/".to_string(),
                hidden: true,
                ..Default::default()
            })
            .unwrap();

        let chain_bits = Qualifiers::CHAIN_START | Qualifiers::CHAIN_END;
        let mut v1 = VisitRow::new(
            visible_url,
            at(10, 0),
            0,
            PageTransition::with(CoreTransition::Link, chain_bits),
        );
        store.add_visit(&mut v1, VisitSource::Browsed).unwrap();
        let mut v2 = VisitRow::new(
            hidden_url,
            at(10, 1),
            0,
            PageTransition::with(CoreTransition::Link, chain_bits),
        );
        store.add_visit(&mut v2, VisitSource::Browsed).unwrap();
        let mut v3 = VisitRow::new(
            visible_url,
            at(10, 2),
            0,
            PageTransition::with(CoreTransition::AutoSubframe, chain_bits),
        );
        store.add_visit(&mut v3, VisitSource::Browsed).unwrap();

        let visible = store.get_visible_visits_in_range(None, None, 0).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, v1.id);
    }

    #[test]
    fn test_segment_usage_increment_and_decrement() {
        let store = HistoryStore::open_in_memory().unwrap();
        let url_id = store
            .add_url(&UrlRow {
                url: "https://a.com/".to_string(),
                ..Default::default()
            })
            .unwrap();
        let segment_id = store.create_segment("http://a.com/", url_id).unwrap();
        let slot = crate::types::midnight_of(at(13, 0));

        store.update_segment_visit_count(segment_id, slot, 1).unwrap();
        store.update_segment_visit_count(segment_id, slot, 1).unwrap();
        let usage = store.get_segment_usage_since(slot).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].visit_count, 2);

        store.update_segment_visit_count(segment_id, slot, -2).unwrap();
        assert!(store.get_segment_usage_since(slot).unwrap().is_empty());
    }

    #[test]
    fn test_keyword_search_term_prefix_query() {
        let store = HistoryStore::open_in_memory().unwrap();
        let url1 = store
            .add_url(&UrlRow {
                url: "https://search.com/?q=rust+lang".to_string(),
                visit_count: 2,
                last_visit: Some(at(11, 0)),
                ..Default::default()
            })
            .unwrap();
        let url2 = store
            .add_url(&UrlRow {
                url: "https://search.com/?q=rusqlite".to_string(),
                visit_count: 1,
                last_visit: Some(at(12, 0)),
                ..Default::default()
            })
            .unwrap();
        store.set_keyword_search_term(url1, 7, "Rust  Lang").unwrap();
        store.set_keyword_search_term(url2, 7, "rusqlite").unwrap();

        let hits = store
            .get_most_recent_keyword_search_terms(7, "rus", 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        // Ordered by last visit, newest first.
        assert_eq!(hits[0].term, "rusqlite");
        assert_eq!(hits[1].term, "Rust  Lang");

        let hits = store
            .get_most_recent_keyword_search_terms(7, "rust", 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].term, "Rust  Lang");
    }

    #[test]
    fn test_metadata_round_trip() {
        let store = HistoryStore::open_in_memory().unwrap();
        assert_eq!(store.get_delete_foreign_visits_until_id().unwrap(), 0);
        assert!(!store.may_contain_foreign_visits().unwrap());

        store.set_delete_foreign_visits_until_id(99).unwrap();
        store.set_may_contain_foreign_visits(true).unwrap();
        assert_eq!(store.get_delete_foreign_visits_until_id().unwrap(), 99);
        assert!(store.may_contain_foreign_visits().unwrap());
    }

    #[test]
    fn test_delete_visit_clears_chain_links() {
        let store = HistoryStore::open_in_memory().unwrap();
        let url_id = store
            .add_url(&UrlRow {
                url: "https://a.com/".to_string(),
                ..Default::default()
            })
            .unwrap();
        let t = PageTransition::new(CoreTransition::Link);
        let mut first = VisitRow::new(url_id, at(8, 0), 0, t);
        store.add_visit(&mut first, VisitSource::Browsed).unwrap();
        let mut second = VisitRow::new(url_id, at(8, 1), first.id, t);
        store.add_visit(&mut second, VisitSource::Browsed).unwrap();

        store.delete_visit(first.id).unwrap();
        let reloaded = store.get_row_for_visit(second.id).unwrap().unwrap();
        assert_eq!(reloaded.referring_visit, 0);
    }
}
