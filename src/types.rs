//! Row and result types shared between the store and the backend engine.
//!
//! All persisted entities are owned by the relational store; the engine only
//! holds bounded, reconstructable caches over them.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::transition::PageTransition;

pub type UrlId = i64;
pub type VisitId = i64;
pub type SegmentId = i64;
pub type KeywordId = i64;
pub type ClusterId = i64;
pub type DownloadId = i64;
pub type ContextId = i64;

/// 0 is "no row" for every opaque id in the schema.
pub const INVALID_URL_ID: UrlId = 0;
pub const INVALID_VISIT_ID: VisitId = 0;
pub const INVALID_SEGMENT_ID: SegmentId = 0;
pub const INVALID_CLUSTER_ID: ClusterId = 0;
pub const INVALID_DOWNLOAD_ID: DownloadId = 0;

/// Timestamps are persisted as microseconds since the Unix epoch.
pub fn time_from_micros(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn time_to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

/// Midnight (UTC) of the day containing `t`, used as the segment-usage and
/// domain-diversity day bucket.
pub fn midnight_of(t: DateTime<Utc>) -> DateTime<Utc> {
    let us = t.timestamp_micros();
    const DAY_US: i64 = 24 * 60 * 60 * 1_000_000;
    time_from_micros(us.div_euclid(DAY_US) * DAY_US)
}

/// Midnight N days after (or before, for negative N) the given midnight.
pub fn midnight_n_days_later(midnight: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    midnight_of(midnight + Duration::days(days))
}

// ============================================
// URL & VISIT ROWS
// ============================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlRow {
    pub id: UrlId,
    pub url: String,
    pub title: String,
    pub visit_count: i32,
    pub typed_count: i32,
    pub last_visit: Option<DateTime<Utc>>,
    pub hidden: bool,
}

/// Where a visit came from. Persisted in `visit_source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitSource {
    Browsed,
    Synced,
    Imported,
    Extension,
}

impl VisitSource {
    pub fn as_i64(self) -> i64 {
        match self {
            VisitSource::Browsed => 0,
            VisitSource::Synced => 1,
            VisitSource::Imported => 2,
            VisitSource::Extension => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => VisitSource::Synced,
            2 => VisitSource::Imported,
            3 => VisitSource::Extension,
            _ => VisitSource::Browsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisitRow {
    pub id: VisitId,
    pub url_id: UrlId,
    pub visit_time: DateTime<Utc>,
    /// 0 = no referrer. Redirect chains are encoded through this link plus
    /// the chain-start/chain-end transition bits, never as a separate list.
    pub referring_visit: VisitId,
    /// Referrer URL for chain starts whose referrer had no tracked visit.
    pub external_referrer_url: String,
    pub opener_visit: VisitId,
    pub transition: PageTransition,
    pub segment_id: SegmentId,
    pub visit_duration: Duration,
    pub incremented_omnibox_typed_score: bool,
    /// Non-empty iff the visit originated on another synced device.
    pub originator_cache_guid: String,
    pub originator_visit_id: VisitId,
    pub originator_referring_visit: VisitId,
    pub originator_opener_visit: VisitId,
    pub is_known_to_sync: bool,
    pub consider_for_most_visited: bool,
}

impl VisitRow {
    pub fn new(url_id: UrlId, visit_time: DateTime<Utc>, referring_visit: VisitId, transition: PageTransition) -> Self {
        VisitRow {
            id: INVALID_VISIT_ID,
            url_id,
            visit_time,
            referring_visit,
            external_referrer_url: String::new(),
            opener_visit: INVALID_VISIT_ID,
            transition,
            segment_id: INVALID_SEGMENT_ID,
            visit_duration: Duration::zero(),
            incremented_omnibox_typed_score: false,
            originator_cache_guid: String::new(),
            originator_visit_id: INVALID_VISIT_ID,
            originator_referring_visit: INVALID_VISIT_ID,
            originator_opener_visit: INVALID_VISIT_ID,
            is_known_to_sync: false,
            consider_for_most_visited: true,
        }
    }

    pub fn is_foreign(&self) -> bool {
        !self.originator_cache_guid.is_empty()
    }
}

// ============================================
// ANNOTATIONS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordState {
    #[default]
    Unknown,
    NoPasswordField,
    HasPasswordField,
}

impl PasswordState {
    pub fn as_i64(self) -> i64 {
        match self {
            PasswordState::Unknown => 0,
            PasswordState::NoPasswordField => 1,
            PasswordState::HasPasswordField => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => PasswordState::NoPasswordField,
            2 => PasswordState::HasPasswordField,
            _ => PasswordState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelCategory {
    pub id: String,
    pub weight: i32,
}

/// Default sentinel meaning "no model ran on this visit".
pub const DEFAULT_VISIBILITY_SCORE: f64 = -1.0;
pub const DEFAULT_MODEL_VERSION: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct ContentAnnotations {
    pub page_language: String,
    pub password_state: PasswordState,
    pub visibility_score: f64,
    pub model_version: i64,
    pub categories: Vec<ModelCategory>,
    pub related_searches: Vec<String>,
    pub alternative_title: String,
    pub browsing_topics_eligible: bool,
}

impl Default for ContentAnnotations {
    fn default() -> Self {
        ContentAnnotations {
            page_language: String::new(),
            password_state: PasswordState::Unknown,
            visibility_score: DEFAULT_VISIBILITY_SCORE,
            model_version: DEFAULT_MODEL_VERSION,
            categories: Vec::new(),
            related_searches: Vec::new(),
            alternative_title: String::new(),
            browsing_topics_eligible: false,
        }
    }
}

/// Fields known at visit time; everything else arrives on tab close.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OnVisitContext {
    pub window_id: i64,
    pub tab_id: i64,
    pub response_code: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextAnnotations {
    pub on_visit: OnVisitContext,
    pub omnibox_url_copied: bool,
    pub is_existing_bookmark: bool,
    pub is_new_bookmark: bool,
    pub total_foreground_duration: Duration,
}

// ============================================
// CLUSTERS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionState {
    #[default]
    Default,
    Hidden,
    Done,
}

impl InteractionState {
    pub fn as_i64(self) -> i64 {
        match self {
            InteractionState::Default => 0,
            InteractionState::Hidden => 1,
            InteractionState::Done => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => InteractionState::Hidden,
            2 => InteractionState::Done,
            _ => InteractionState::Default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnotatedVisit {
    pub url_row: UrlRow,
    pub visit_row: VisitRow,
    pub context_annotations: ContextAnnotations,
    pub content_annotations: ContentAnnotations,
    pub referring_visit_of_redirect_chain_start: VisitId,
    pub opener_visit_of_redirect_chain_start: VisitId,
    pub source: VisitSource,
}

#[derive(Debug, Clone)]
pub struct DuplicateClusterVisit {
    pub visit_id: VisitId,
    pub url: String,
    pub visit_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClusterVisit {
    pub annotated_visit: AnnotatedVisit,
    pub score: f64,
    pub interaction_state: InteractionState,
    /// Visits subsumed by this one and excluded from top-level display.
    pub duplicate_visits: Vec<DuplicateClusterVisit>,
}

#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub cluster_id: ClusterId,
    pub visits: Vec<ClusterVisit>,
    pub keywords: Vec<String>,
    pub originator_cache_guid: String,
    pub originator_cluster_id: ClusterId,
}

impl Cluster {
    /// Visits are kept sorted by score; the most recent visit decides the
    /// cluster's place in reverse-chronological listings.
    pub fn most_recent_visit_time(&self) -> Option<DateTime<Utc>> {
        self.visits.iter().map(|v| v.annotated_visit.visit_row.visit_time).max()
    }
}

// ============================================
// SEARCH TERMS & DOWNLOADS
// ============================================

#[derive(Debug, Clone)]
pub struct KeywordSearchTermRow {
    pub keyword_id: KeywordId,
    pub url_id: UrlId,
    pub term: String,
    pub normalized_term: String,
}

#[derive(Debug, Clone)]
pub struct KeywordSearchTermVisit {
    pub term: String,
    pub visit_count: i64,
    pub last_visit_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadRow {
    pub id: DownloadId,
    pub guid: String,
    pub url: String,
    pub target_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub received_bytes: i64,
    pub total_bytes: i64,
    pub state: i32,
    pub opened: bool,
}

// ============================================
// QUERY OPTIONS & RESULTS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep only the most recent visit per URL.
    #[default]
    RemoveAll,
    /// Keep the most recent visit per URL per day.
    RemovePerDay,
    KeepAll,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 0 = unlimited.
    pub max_count: usize,
    pub duplicate_policy: DuplicatePolicy,
    /// For text queries: match the query against the host only.
    pub host_only: bool,
}

impl QueryOptions {
    pub fn effective_max_count(&self) -> usize {
        if self.max_count == 0 {
            usize::MAX
        } else {
            self.max_count
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlResult {
    pub row: UrlRow,
    pub visit_time: DateTime<Utc>,
    pub content_annotations: Option<ContentAnnotations>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResults {
    pub results: Vec<UrlResult>,
    /// True once a paginated query has walked past the earliest recorded
    /// visit.
    pub reached_beginning: bool,
}

#[derive(Debug, Clone)]
pub struct QueryUrlResult {
    pub row: UrlRow,
    pub visits: Vec<VisitRow>,
}

#[derive(Debug, Clone)]
pub struct MostVisitedUrl {
    pub url: String,
    pub title: String,
    pub visit_count: i32,
    pub last_visit_time: Option<DateTime<Utc>>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DomainMetricCount {
    pub count: usize,
    pub begin_time: DateTime<Utc>,
}

/// Unique-domain counts over trailing 1/7/28-day windows ending at
/// `end_time`.
#[derive(Debug, Clone)]
pub struct DomainMetricSet {
    pub end_time: DateTime<Utc>,
    pub one_day: Option<DomainMetricCount>,
    pub seven_day: Option<DomainMetricCount>,
    pub twenty_eight_day: Option<DomainMetricCount>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomainMetricBitmask: u32 {
        const LAST_1_DAY = 1 << 0;
        const LAST_7_DAY = 1 << 1;
        const LAST_28_DAY = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct LastVisitResult {
    pub success: bool,
    pub last_visit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct VisibleVisitCountToHost {
    pub count: i64,
    pub first_visit: Option<DateTime<Utc>>,
}

// ============================================
// DELETION
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    UserInitiated,
    Expiration,
    DeleteAllForeignVisits,
    Other,
}

/// Passed to `Delegate::notify_deletions`.
#[derive(Debug, Clone)]
pub struct DeletionInfo {
    pub is_all_history: bool,
    pub reason: DeletionReason,
    pub deleted_rows: Vec<UrlRow>,
    pub deleted_visit_ids: Vec<VisitId>,
}

impl DeletionInfo {
    pub fn for_all_history() -> Self {
        DeletionInfo {
            is_all_history: true,
            reason: DeletionReason::UserInitiated,
            deleted_rows: Vec::new(),
            deleted_visit_ids: Vec::new(),
        }
    }

    pub fn is_from_expiration(&self) -> bool {
        self.reason == DeletionReason::Expiration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midnight_bucketing() {
        let t = Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap();
        let m = midnight_of(t);
        assert_eq!(m, Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap());
        assert_eq!(midnight_of(m), m);
        assert_eq!(
            midnight_n_days_later(m, -7),
            Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_micros_round_trip() {
        let t = Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 0).unwrap();
        assert_eq!(time_from_micros(time_to_micros(t)), t);
    }

    #[test]
    fn test_foreign_visit_identity() {
        let mut row = VisitRow::new(1, Utc::now(), 0, PageTransition::default());
        assert!(!row.is_foreign());
        row.originator_cache_guid = "device-abc".to_string();
        assert!(row.is_foreign());
    }
}
