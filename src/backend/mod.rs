//! The history backend engine.
//!
//! Single-sequence object: the embedder must funnel every call through one
//! task queue. The engine owns the history and favicon stores, the visit
//! tracker, the redirect cache, and the long-running transaction that
//! batches writes into commit windows.

mod queries;
mod segments;
mod sync;

pub use sync::ForeignVisitSweepTask;

use chrono::{DateTime, Duration, Utc};
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::delegate::Delegate;
use crate::expire::{self, DeletionEffects};
use crate::favicons::{Favicon, FaviconStore};
use crate::redirects::RedirectCache;
use crate::store::{error_is_catastrophic, HistoryStore};
use crate::tasks::{QueuedTask, TaskQueue, TaskStatus};
use crate::tracker::VisitTracker;
use crate::transition::{CoreTransition, PageTransition, Qualifiers};
use crate::types::{
    ContentAnnotations, ContextAnnotations, ContextId, DeletionInfo, DeletionReason, DownloadId,
    DownloadRow, KeywordId, UrlId, UrlRow, VisitId, VisitRow, VisitSource, INVALID_DOWNLOAD_ID,
    INVALID_VISIT_ID,
};

/// Opener of a navigation, resolved to a visit through the tracker.
#[derive(Debug, Clone)]
pub struct Opener {
    pub context_id: ContextId,
    pub nav_entry_id: i32,
    pub url: String,
}

/// One completed navigation, as handed to `add_page`.
#[derive(Debug, Clone)]
pub struct AddPageArgs {
    pub url: String,
    pub time: DateTime<Utc>,
    pub context_id: ContextId,
    pub nav_entry_id: i32,
    /// Set for local visits coming from a live navigation; forwarded to the
    /// delegate untouched.
    pub local_navigation_id: Option<i64>,
    pub referrer: Option<String>,
    /// Ordered redirect chain; when non-empty its last element must equal
    /// `url`.
    pub redirects: Vec<String>,
    pub transition: PageTransition,
    pub visit_source: VisitSource,
    /// The navigation replaced the current entry (client redirect).
    pub did_replace_entry: bool,
    pub consider_for_ntp_most_visited: bool,
    pub title: Option<String>,
    pub opener: Option<Opener>,
}

impl AddPageArgs {
    pub fn new(url: &str, time: DateTime<Utc>, transition: PageTransition) -> Self {
        AddPageArgs {
            url: url.to_string(),
            time,
            context_id: 0,
            nav_entry_id: 0,
            local_navigation_id: None,
            referrer: None,
            redirects: Vec::new(),
            transition,
            visit_source: VisitSource::Browsed,
            did_replace_entry: false,
            consider_for_ntp_most_visited: true,
            title: None,
            opener: None,
        }
    }
}

pub struct HistoryBackend {
    store: Option<HistoryStore>,
    favicons: Option<FaviconStore>,
    config: Config,
    delegate: Box<dyn Delegate>,
    tracker: VisitTracker,
    recent_redirects: RedirectCache,
    tasks: TaskQueue,
    commit_deadline: Option<Instant>,
    first_recorded_time: Option<DateTime<Utc>>,
    scheduled_kill_db: bool,
    foreign_sweep_running: bool,
    /// Gates foreign-visit contributions to segment scoring. Product policy,
    /// injected rather than hard-coded.
    foreign_segment_policy: Box<dyn Fn(&VisitRow) -> bool>,
}

fn record_failure(kill_flag: &mut bool, op: &str, err: &anyhow::Error) {
    warn!(op, error = %err, "history store operation failed");
    if error_is_catastrophic(err) {
        *kill_flag = true;
    }
}

impl HistoryBackend {
    /// Opens the backend against the configured database files. Never fails:
    /// a store that cannot open leaves the engine in degraded mode where
    /// every operation is a no-op or returns empty.
    pub fn open(config: Config, delegate: Box<dyn Delegate>) -> Self {
        let store = match HistoryStore::open(&config.history_path()) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(error = %err, "failed to open history database");
                None
            }
        };
        let favicons = match FaviconStore::open(&config.favicons_path()) {
            Ok(favicons) => Some(favicons),
            Err(err) => {
                warn!(error = %err, "failed to open favicon database");
                None
            }
        };
        Self::init(config, delegate, store, favicons)
    }

    pub fn open_in_memory(config: Config, delegate: Box<dyn Delegate>) -> Self {
        let store = HistoryStore::open_in_memory().ok();
        let favicons = FaviconStore::open_in_memory().ok();
        Self::init(config, delegate, store, favicons)
    }

    fn init(
        config: Config,
        delegate: Box<dyn Delegate>,
        mut store: Option<HistoryStore>,
        mut favicons: Option<FaviconStore>,
    ) -> Self {
        let mut first_recorded_time = None;
        if let Some(store) = store.as_mut() {
            if let Err(err) = store.begin_singleton_transaction() {
                warn!(error = %err, "initial transaction begin failed");
            }
            first_recorded_time = store.get_first_recorded_visit_time().unwrap_or(None);
        }
        if let Some(favicons) = favicons.as_mut() {
            if let Err(err) = favicons.begin_singleton_transaction() {
                warn!(error = %err, "initial favicon transaction begin failed");
            }
        }

        let allow_foreign_segments = config.sync.foreign_visits_in_segments;
        let capacity = config.backend.redirect_cache_capacity;
        let mut backend = HistoryBackend {
            store,
            favicons,
            config,
            delegate,
            tracker: VisitTracker::new(),
            recent_redirects: RedirectCache::new(capacity),
            tasks: TaskQueue::default(),
            commit_deadline: None,
            first_recorded_time,
            scheduled_kill_db: false,
            foreign_sweep_running: false,
            foreign_segment_policy: Box::new(move |_| allow_foreign_segments),
        };
        backend.resume_foreign_visit_sweep();
        backend
    }

    pub fn set_foreign_segment_policy(&mut self, policy: Box<dyn Fn(&VisitRow) -> bool>) {
        self.foreign_segment_policy = policy;
    }

    pub fn first_recorded_time(&self) -> Option<DateTime<Utc>> {
        self.first_recorded_time
    }

    // ============================================
    // PAGE-VISIT INGESTION
    // ============================================

    pub fn add_page(&mut self, args: AddPageArgs) {
        if self.store.is_none() {
            return;
        }

        let mut transition = args.transition;
        let is_keyword_generated = transition.core_type_is(CoreTransition::KeywordGenerated);

        let referrer_url = args.referrer.clone().unwrap_or_default();
        let from_visit_id = if referrer_url.is_empty() {
            INVALID_VISIT_ID
        } else {
            self.tracker
                .get_last_visit(args.context_id, args.nav_entry_id, &referrer_url)
        };
        let opener_visit_id = args
            .opener
            .as_ref()
            .map(|o| self.tracker.get_last_visit(o.context_id, o.nav_entry_id, &o.url))
            .unwrap_or(INVALID_VISIT_ID);

        // A navigation to a never-typed single-label host is upgraded to
        // TYPED so the intranet host is remembered by the omnibox.
        if !transition.core_type_is(CoreTransition::Typed)
            && !is_keyword_generated
            && transition.is_new_navigation()
            && (self.is_untyped_intranet_host(&args.url)
                || args
                    .redirects
                    .first()
                    .is_some_and(|u| self.is_untyped_intranet_host(u)))
        {
            transition = transition.with_core(CoreTransition::Typed);
        }

        let hidden = !transition.is_main_frame() || is_keyword_generated;
        // Chain and redirect bits are assigned per element below.
        let base = transition.without(
            Qualifiers::CHAIN_START
                | Qualifiers::CHAIN_END
                | Qualifiers::CLIENT_REDIRECT
                | Qualifiers::SERVER_REDIRECT,
        );

        let last_visit_id;
        if args.redirects.len() <= 1 {
            let t = base.union(Qualifiers::CHAIN_START | Qualifiers::CHAIN_END);
            let external_referrer = if from_visit_id == INVALID_VISIT_ID {
                referrer_url.clone()
            } else {
                String::new()
            };
            let typed_increment = t.is_typed_increment();
            let Some((_, visit_id)) = self.add_page_visit(
                &args.url,
                args.time,
                from_visit_id,
                &external_referrer,
                t,
                hidden,
                args.visit_source,
                typed_increment,
                opener_visit_id,
                args.consider_for_ntp_most_visited,
                args.local_navigation_id,
                args.title.as_deref(),
            ) else {
                return;
            };
            last_visit_id = visit_id;
            if args.consider_for_ntp_most_visited && !is_keyword_generated {
                self.assign_segment_for_new_visit(&args.url, from_visit_id, visit_id, t, args.time);
            }
            self.recent_redirects.put(&args.url, vec![args.url.clone()]);
        } else {
            debug_assert_eq!(args.redirects.last(), Some(&args.url));

            let mut chain = args.redirects.clone();
            let mut start_qualifier = Qualifiers::CHAIN_START;
            let mut extended_prefix: Vec<String> = Vec::new();

            if chain[0].starts_with("about:") && from_visit_id == INVALID_VISIT_ID {
                // An about: source with no referrer cannot be attributed.
                chain.remove(0);
            } else if transition.has(Qualifiers::CLIENT_REDIRECT) {
                // The first element is the previous page, already recorded;
                // the new visits continue its chain instead of starting one.
                start_qualifier = Qualifiers::CLIENT_REDIRECT;
                if !referrer_url.is_empty() {
                    chain.remove(0);
                    if args.did_replace_entry {
                        self.clear_chain_end(from_visit_id);
                        extended_prefix = self.recent_redirects.get(&referrer_url);
                    }
                }
            } else if transition.core_type_is(CoreTransition::FormSubmit) && chain.len() > 1 {
                // The POST target must not take over the referring page's
                // title and favicon.
                chain.remove(0);
            }
            if chain.is_empty() {
                chain.push(args.url.clone());
            }

            // A plain http -> https upgrade at the head of a typed chain
            // moves the typed credit onto the https hop.
            let typed_transfer = base.core_type_is(CoreTransition::Typed)
                && chain.len() >= 2
                && is_trivial_https_upgrade(&chain[0], &chain[1]);
            let start_would_increment = base.union(start_qualifier).is_typed_increment();

            let mut qualifier = start_qualifier;
            let mut prev_visit = from_visit_id;
            let mut last_id = INVALID_VISIT_ID;
            for (index, item) in chain.iter().enumerate() {
                let mut t = base.union(qualifier);
                if index == chain.len() - 1 {
                    t = t.union(Qualifiers::CHAIN_END);
                }
                let typed_increment = if typed_transfer {
                    match index {
                        0 => false,
                        1 => start_would_increment,
                        _ => t.is_typed_increment(),
                    }
                } else {
                    t.is_typed_increment()
                };
                let external_referrer = if index == 0 && prev_visit == INVALID_VISIT_ID {
                    referrer_url.clone()
                } else {
                    String::new()
                };
                let opener = if index == 0 {
                    opener_visit_id
                } else {
                    INVALID_VISIT_ID
                };
                let title = if index == chain.len() - 1 {
                    args.title.as_deref()
                } else {
                    None
                };
                let Some((_, visit_id)) = self.add_page_visit(
                    item,
                    args.time,
                    prev_visit,
                    &external_referrer,
                    t,
                    hidden,
                    args.visit_source,
                    typed_increment,
                    opener,
                    args.consider_for_ntp_most_visited,
                    args.local_navigation_id,
                    title,
                ) else {
                    return;
                };
                if t.has(Qualifiers::CHAIN_START)
                    && args.consider_for_ntp_most_visited
                    && !is_keyword_generated
                {
                    self.assign_segment_for_new_visit(item, prev_visit, visit_id, t, args.time);
                }
                prev_visit = visit_id;
                last_id = visit_id;
                qualifier = Qualifiers::SERVER_REDIRECT;
            }
            last_visit_id = last_id;

            // The https twin inherits the http page's favicon mappings
            if typed_transfer {
                if let Some(favicons) = self.favicons.as_ref() {
                    if let Err(err) = favicons.clone_favicon_mappings(&chain[0], &chain[1]) {
                        warn!(error = %err, "favicon mapping clone failed");
                    }
                }
            }

            let mut full_chain = extended_prefix;
            full_chain.extend(chain.iter().cloned());
            self.recent_redirects.put(&args.url, full_chain);
        }

        if !is_keyword_generated && transition.is_main_frame() {
            self.tracker
                .add_visit(args.context_id, args.nav_entry_id, &args.url, last_visit_id);
        }
        self.schedule_commit();
    }

    /// URL upsert plus one visit insert; the shared tail of every ingestion
    /// path. Returns None when the store fails (logged, possibly scheduling
    /// a raze).
    #[allow(clippy::too_many_arguments)]
    fn add_page_visit(
        &mut self,
        url: &str,
        time: DateTime<Utc>,
        from_visit: VisitId,
        external_referrer: &str,
        transition: PageTransition,
        hidden: bool,
        source: VisitSource,
        typed_increment: bool,
        opener_visit: VisitId,
        consider_for_most_visited: bool,
        local_navigation_id: Option<i64>,
        title: Option<&str>,
    ) -> Option<(UrlId, VisitId)> {
        let store = self.store.as_ref()?;
        let outcome = add_page_visit_rows(
            store,
            url,
            time,
            from_visit,
            external_referrer,
            transition,
            hidden,
            source,
            typed_increment,
            opener_visit,
            consider_for_most_visited,
            title,
        );
        match outcome {
            Ok((url_row, visit_row)) => {
                if self.first_recorded_time.map_or(true, |t| visit_row.visit_time < t) {
                    self.first_recorded_time = Some(visit_row.visit_time);
                }
                self.delegate
                    .notify_visit(&url_row, &visit_row, local_navigation_id);
                Some((url_row.id, visit_row.id))
            }
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "add_page_visit", &err);
                None
            }
        }
    }

    fn clear_chain_end(&mut self, visit_id: VisitId) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            if let Some(mut row) = store.get_row_for_visit(visit_id)? {
                if row.transition.has(Qualifiers::CHAIN_END) {
                    row.transition = row.transition.without(Qualifiers::CHAIN_END);
                    store.update_visit_row(&row)?;
                }
            }
            Ok(())
        })();
        if let Err(err) = outcome {
            record_failure(&mut self.scheduled_kill_db, "clear_chain_end", &err);
        }
    }

    fn is_untyped_intranet_host(&self, url: &str) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https" | "ftp") {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if host.is_empty() || host.contains('.') {
            return false;
        }
        let prefixes: Vec<String> = ["http", "https", "ftp"]
            .iter()
            .map(|scheme| format!("{scheme}://{host}/"))
            .collect();
        !store.has_typed_urls_with_prefixes(&prefixes).unwrap_or(false)
    }

    /// The cached redirect chain ending at `url`, or `[url]` on a miss.
    pub fn get_cached_recent_redirects(&mut self, url: &str) -> Vec<String> {
        self.recent_redirects.get(url)
    }

    pub fn clear_cached_data_for_context(&mut self, context_id: ContextId) {
        self.tracker.clear_cached_data_for_context(context_id);
    }

    // ============================================
    // TITLES, BOOKMARK STUBS, VISIT UPDATES
    // ============================================

    /// Applies the title to the URL and every page on its cached redirect
    /// chain, so redirect sources show the final title.
    pub fn set_page_title(&mut self, url: &str, title: &str) {
        if self.store.is_none() {
            return;
        }
        let chain = self.recent_redirects.get(url);
        let mut modified = Vec::new();
        {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            for chain_url in &chain {
                match store.get_row_for_url(chain_url) {
                    Ok(Some(mut row)) => {
                        if row.title != title {
                            row.title = title.to_string();
                            match store.update_url_row(&row) {
                                Ok(_) => modified.push(row),
                                Err(err) => record_failure(
                                    &mut self.scheduled_kill_db,
                                    "set_page_title",
                                    &err,
                                ),
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        record_failure(&mut self.scheduled_kill_db, "set_page_title", &err)
                    }
                }
            }
        }
        for row in &modified {
            self.delegate.notify_url_modified(row);
        }
        if !modified.is_empty() {
            self.schedule_commit();
        }
    }

    /// Ensures a URL row exists for a bookmarked page that was never
    /// visited. Counts stay at zero.
    pub fn add_page_no_visit_for_bookmark(&mut self, url: &str, title: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            if store.get_row_for_url(url)?.is_none() {
                store.add_url(&UrlRow {
                    url: url.to_string(),
                    title: title.to_string(),
                    ..Default::default()
                })?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "add_page_no_visit_for_bookmark",
                &err,
            ),
        }
    }

    pub fn update_visit_duration(&mut self, visit_id: VisitId, end_time: DateTime<Utc>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            let Some(mut row) = store.get_row_for_visit(visit_id)? else {
                debug!(visit_id, "update_visit_duration on unknown visit");
                return Ok(());
            };
            if end_time >= row.visit_time {
                row.visit_duration = end_time - row.visit_time;
                store.update_visit_row(&row)?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "update_visit_duration", &err)
            }
        }
    }

    pub fn mark_visit_as_known_to_sync(&mut self, visit_id: VisitId) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let outcome = (|| -> anyhow::Result<bool> {
            let Some(mut row) = store.get_row_for_visit(visit_id)? else {
                return Ok(false);
            };
            row.is_known_to_sync = true;
            store.update_visit_row(&row)?;
            store.set_metadata("known_to_sync_visits_exist", 1)?;
            Ok(true)
        })();
        match outcome {
            Ok(marked) => {
                if marked {
                    self.schedule_commit();
                }
                marked
            }
            Err(err) => {
                record_failure(
                    &mut self.scheduled_kill_db,
                    "mark_visit_as_known_to_sync",
                    &err,
                );
                false
            }
        }
    }

    // ============================================
    // ANNOTATIONS
    // ============================================

    fn visit_exists(&self, visit_id: VisitId) -> bool {
        self.store
            .as_ref()
            .and_then(|store| store.get_row_for_visit(visit_id).ok())
            .flatten()
            .is_some()
    }

    fn tracked_visit(&self, context_id: ContextId, nav_entry_id: i32, url: &str) -> VisitId {
        self.tracker.get_last_visit(context_id, nav_entry_id, url)
    }

    pub fn add_context_annotations_for_visit(
        &mut self,
        visit_id: VisitId,
        annotations: ContextAnnotations,
    ) {
        if !self.visit_exists(visit_id) {
            debug!(visit_id, "context annotations for unknown visit dropped");
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.set_context_annotations_for_visit(visit_id, &annotations) {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "add_context_annotations",
                &err,
            ),
        }
    }

    /// Merges tab-close context fields into the stored annotations while
    /// keeping the on-visit fields recorded at navigation time.
    pub fn set_on_close_context_annotations_for_visit(
        &mut self,
        visit_id: VisitId,
        annotations: ContextAnnotations,
    ) {
        if !self.visit_exists(visit_id) {
            debug!(visit_id, "on-close annotations for unknown visit dropped");
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            let mut merged = store
                .get_context_annotations_for_visit(visit_id)?
                .unwrap_or_default();
            merged.omnibox_url_copied = annotations.omnibox_url_copied;
            merged.is_existing_bookmark = annotations.is_existing_bookmark;
            merged.is_new_bookmark = annotations.is_new_bookmark;
            merged.total_foreground_duration = annotations.total_foreground_duration;
            store.set_context_annotations_for_visit(visit_id, &merged)
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "set_on_close_context_annotations",
                &err,
            ),
        }
    }

    fn merge_content_annotations<F>(&mut self, visit_id: VisitId, op: &str, apply: F)
    where
        F: FnOnce(&mut ContentAnnotations),
    {
        if !self.visit_exists(visit_id) {
            debug!(visit_id, op, "content annotations for unknown visit dropped");
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            let mut annotations = store
                .get_content_annotations_for_visit(visit_id)?
                .unwrap_or_default();
            apply(&mut annotations);
            store.set_content_annotations_for_visit(visit_id, &annotations)
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(&mut self.scheduled_kill_db, "merge_content_annotations", &err),
        }
    }

    pub fn set_page_language_for_visit(
        &mut self,
        context_id: ContextId,
        nav_entry_id: i32,
        url: &str,
        language: &str,
    ) {
        let visit_id = self.tracked_visit(context_id, nav_entry_id, url);
        if visit_id != INVALID_VISIT_ID {
            self.set_page_language_for_visit_by_id(visit_id, language);
        }
    }

    pub fn set_page_language_for_visit_by_id(&mut self, visit_id: VisitId, language: &str) {
        let language = language.to_string();
        self.merge_content_annotations(visit_id, "page_language", move |a| {
            a.page_language = language;
        });
    }

    pub fn set_password_state_for_visit(
        &mut self,
        context_id: ContextId,
        nav_entry_id: i32,
        url: &str,
        state: crate::types::PasswordState,
    ) {
        let visit_id = self.tracked_visit(context_id, nav_entry_id, url);
        if visit_id != INVALID_VISIT_ID {
            self.set_password_state_for_visit_by_id(visit_id, state);
        }
    }

    pub fn set_password_state_for_visit_by_id(
        &mut self,
        visit_id: VisitId,
        state: crate::types::PasswordState,
    ) {
        self.merge_content_annotations(visit_id, "password_state", move |a| {
            a.password_state = state;
        });
    }

    /// Merges model output into the stored annotations; sentinel (-1) fields
    /// in the input leave the stored value untouched.
    pub fn add_content_model_annotations_for_visit(
        &mut self,
        visit_id: VisitId,
        model: ContentAnnotations,
    ) {
        self.merge_content_annotations(visit_id, "model_annotations", move |a| {
            if model.visibility_score >= 0.0 {
                a.visibility_score = model.visibility_score;
            }
            if model.model_version >= 0 {
                a.model_version = model.model_version;
            }
            if !model.categories.is_empty() {
                a.categories = model.categories;
            }
        });
    }

    pub fn add_related_searches_for_visit(&mut self, visit_id: VisitId, searches: Vec<String>) {
        self.merge_content_annotations(visit_id, "related_searches", move |a| {
            a.related_searches = searches;
        });
    }

    // ============================================
    // KEYWORD SEARCH TERMS
    // ============================================

    pub fn set_keyword_search_terms_for_url(
        &mut self,
        url: &str,
        keyword_id: KeywordId,
        term: &str,
    ) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<bool> {
            let Some(row) = store.get_row_for_url(url)? else {
                return Ok(false);
            };
            // Unchanged terms are not rewritten
            if let Some(existing) = store.get_keyword_search_term_row(row.id)? {
                if existing.keyword_id == keyword_id && existing.term == term {
                    return Ok(true);
                }
            }
            store.set_keyword_search_term(row.id, keyword_id, term)?;
            Ok(true)
        })();
        match outcome {
            Ok(true) => self.schedule_commit(),
            Ok(false) => debug!(url, "keyword term for unknown url dropped"),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "set_keyword_search_terms",
                &err,
            ),
        }
    }

    pub fn delete_all_search_terms_for_keyword(&mut self, keyword_id: KeywordId) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.delete_all_search_terms_for_keyword(keyword_id) {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "delete_all_search_terms_for_keyword",
                &err,
            ),
        }
    }

    pub fn delete_keyword_search_term_for_url(&mut self, url: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            if let Some(row) = store.get_row_for_url(url)? {
                store.delete_keyword_search_term_for_url(row.id)?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "delete_keyword_search_term_for_url",
                &err,
            ),
        }
    }

    /// Deletes every URL carrying the given search term for the keyword.
    pub fn delete_matching_urls_for_keyword(&mut self, keyword_id: KeywordId, term: &str) {
        let urls = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            match store.get_urls_for_keyword_term(keyword_id, term) {
                Ok(urls) => urls,
                Err(err) => {
                    record_failure(
                        &mut self.scheduled_kill_db,
                        "delete_matching_urls_for_keyword",
                        &err,
                    );
                    return;
                }
            }
        };
        if !urls.is_empty() {
            self.delete_urls(&urls);
        }
    }

    // ============================================
    // FAVICONS
    // ============================================

    /// Maps the icon onto the page and every page on its cached redirect
    /// chain.
    pub fn set_favicon(&mut self, page_url: &str, icon_url: &str, image_data: &[u8]) {
        let chain = self.recent_redirects.get(page_url);
        let Some(favicons) = self.favicons.as_ref() else {
            return;
        };
        let now = Utc::now();
        for url in &chain {
            if let Err(err) = favicons.set_favicon(url, icon_url, image_data, now) {
                warn!(error = %err, "favicon write failed");
                return;
            }
        }
        self.schedule_commit();
    }

    pub fn get_favicon_for_page(&mut self, page_url: &str) -> Option<Favicon> {
        let favicons = self.favicons.as_ref()?;
        match favicons.get_favicon_for_page(page_url) {
            Ok(icon) => icon,
            Err(err) => {
                warn!(error = %err, "favicon read failed");
                None
            }
        }
    }

    // ============================================
    // DOWNLOADS
    // ============================================

    pub fn create_download(&mut self, row: &DownloadRow) -> DownloadId {
        let Some(store) = self.store.as_ref() else {
            return INVALID_DOWNLOAD_ID;
        };
        match store.create_download(row) {
            Ok(id) => {
                self.schedule_commit();
                id
            }
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "create_download", &err);
                INVALID_DOWNLOAD_ID
            }
        }
    }

    pub fn update_download(&mut self, row: &DownloadRow, should_commit_immediately: bool) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.update_download(row) {
            Ok(_) => {
                if should_commit_immediately {
                    self.commit();
                } else {
                    self.schedule_commit();
                }
            }
            Err(err) => record_failure(&mut self.scheduled_kill_db, "update_download", &err),
        }
    }

    /// Removal is privacy sensitive, so it commits synchronously.
    pub fn remove_downloads(&mut self, ids: &[DownloadId]) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.remove_downloads(ids) {
            Ok(_) => self.commit(),
            Err(err) => record_failure(&mut self.scheduled_kill_db, "remove_downloads", &err),
        }
    }

    pub fn query_downloads(&mut self) -> Vec<DownloadRow> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        match store.get_downloads() {
            Ok(rows) => rows,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "query_downloads", &err);
                Vec::new()
            }
        }
    }

    pub fn get_next_download_id(&mut self) -> DownloadId {
        let Some(store) = self.store.as_ref() else {
            return INVALID_DOWNLOAD_ID;
        };
        match store.get_next_download_id() {
            Ok(id) => id,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_next_download_id", &err);
                INVALID_DOWNLOAD_ID
            }
        }
    }

    // ============================================
    // DELETION
    // ============================================

    pub fn delete_url(&mut self, url: &str) {
        self.delete_urls(std::slice::from_ref(&url.to_string()));
    }

    pub fn delete_urls(&mut self, urls: &[String]) {
        let effects = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            match expire::delete_urls(store, urls) {
                Ok(effects) => effects,
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "delete_urls", &err);
                    return;
                }
            }
        };
        self.finish_deletion(effects, DeletionReason::UserInitiated, true);
    }

    /// Deletes all visits in `[begin, end)`, optionally restricted to the
    /// given URLs. The fully unbounded, unrestricted form takes the
    /// delete-all fast path.
    pub fn expire_history_between(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        restrict_urls: &[String],
    ) {
        if begin.is_none() && end.is_none() && restrict_urls.is_empty() {
            self.delete_all_history(&[]);
            return;
        }
        let effects = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            match expire::expire_history_between(store, begin, end, restrict_urls) {
                Ok(effects) => effects,
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "expire_history_between", &err);
                    return;
                }
            }
        };
        self.finish_deletion(effects, DeletionReason::UserInitiated, true);
    }

    /// Deletes the visits recorded at exactly the given timestamps.
    pub fn expire_history_for_times(&mut self, times: &[DateTime<Utc>]) {
        let effects = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            let outcome = (|| -> anyhow::Result<DeletionEffects> {
                let mut visits = Vec::new();
                for time in times {
                    visits.extend(
                        store.get_visits_in_range(
                            Some(*time),
                            Some(*time + Duration::microseconds(1)),
                        )?,
                    );
                }
                expire::delete_visits(store, &visits, &std::collections::HashSet::new())
            })();
            match outcome {
                Ok(effects) => effects,
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "expire_history_for_times", &err);
                    return;
                }
            }
        };
        self.finish_deletion(effects, DeletionReason::UserInitiated, true);
    }

    /// Clears all history tables, re-adding `kept_urls` (pinned or
    /// bookmarked pages) as zero-count stubs.
    pub fn delete_all_history(&mut self, kept_urls: &[String]) {
        {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            let outcome = (|| -> anyhow::Result<()> {
                let mut kept_rows = Vec::new();
                for url in kept_urls {
                    if let Some(row) = store.get_row_for_url(url)? {
                        kept_rows.push(row);
                    }
                }
                store.clear_history_tables()?;
                for row in kept_rows {
                    store.add_url(&UrlRow {
                        id: 0,
                        url: row.url,
                        title: row.title,
                        visit_count: 0,
                        typed_count: 0,
                        last_visit: None,
                        hidden: row.hidden,
                    })?;
                }
                Ok(())
            })();
            if let Err(err) = outcome {
                record_failure(&mut self.scheduled_kill_db, "delete_all_history", &err);
                return;
            }
        }
        if kept_urls.is_empty() {
            if let Some(favicons) = self.favicons.as_ref() {
                if let Err(err) = favicons.clear() {
                    warn!(error = %err, "favicon clear failed");
                }
            }
        }
        self.tracker.clear();
        self.recent_redirects.clear();
        self.first_recorded_time = None;
        self.delegate.notify_deletions(&DeletionInfo::for_all_history());
        self.commit();
    }

    /// One bounded pass of age-based expiration. Honors the keep-all-history
    /// configuration.
    pub fn expire_old_history(&mut self, now: DateTime<Utc>) {
        if self.config.backend.keep_all_history {
            return;
        }
        let threshold = now - Duration::days(self.config.backend.expire_days_threshold);
        let effects = {
            let Some(store) = self.store.as_ref() else {
                return;
            };
            match expire::expire_old_history(store, threshold) {
                Ok(effects) => effects,
                Err(err) => {
                    record_failure(&mut self.scheduled_kill_db, "expire_old_history", &err);
                    return;
                }
            }
        };
        if !effects.deleted_visit_ids.is_empty() {
            self.finish_deletion(effects, DeletionReason::Expiration, false);
        }
    }

    fn finish_deletion(
        &mut self,
        effects: DeletionEffects,
        reason: DeletionReason,
        privacy_sensitive: bool,
    ) {
        for (visit_id, visit_time) in effects
            .deleted_visit_ids
            .iter()
            .zip(effects.deleted_visit_times.iter())
        {
            self.tracker.remove_visit_by_id(*visit_id);
            self.delegate.notify_visit_deleted(*visit_id, *visit_time);
        }
        if let Some(favicons) = self.favicons.as_ref() {
            if let Err(err) = favicons
                .delete_mappings_for_pages(&effects.deleted_page_urls)
                .and_then(|_| favicons.delete_unused_icons().map(|_| ()))
            {
                warn!(error = %err, "favicon cleanup failed");
            }
        }
        if let Some(store) = self.store.as_ref() {
            self.first_recorded_time = store.get_first_recorded_visit_time().unwrap_or(None);
        }
        for row in &effects.modified_urls {
            self.delegate.notify_url_modified(row);
        }
        let info = effects.into_deletion_info(reason);
        self.delegate.notify_deletions(&info);
        if privacy_sensitive {
            self.commit();
        } else {
            self.schedule_commit();
        }
    }

    // ============================================
    // COMMIT DISCIPLINE
    // ============================================

    /// Idempotent: a pending deadline is left in place so writes batch into
    /// one commit per window.
    pub fn schedule_commit(&mut self) {
        if self.commit_deadline.is_none() {
            self.commit_deadline = Some(
                Instant::now()
                    + StdDuration::from_secs(self.config.backend.commit_interval_secs),
            );
        }
    }

    pub fn has_pending_commit(&self) -> bool {
        self.commit_deadline.is_some()
    }

    /// Fires due deferred work: a scheduled raze first, then the commit
    /// timer.
    pub fn tick(&mut self, now: Instant) {
        if self.scheduled_kill_db {
            self.kill_history_database();
        }
        if let Some(deadline) = self.commit_deadline {
            if now >= deadline {
                self.commit();
            }
        }
    }

    /// Commits the open transaction and immediately begins the next one, for
    /// both databases. Cancels any pending scheduled commit.
    pub fn commit(&mut self) {
        self.commit_deadline = None;
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.commit_singleton_transaction() {
                warn!(error = %err, "history commit failed, retrying next cycle");
            }
            if let Err(err) = store.begin_singleton_transaction() {
                warn!(error = %err, "history transaction begin failed");
            }
        }
        if let Some(favicons) = self.favicons.as_mut() {
            if let Err(err) = favicons.commit_singleton_transaction() {
                warn!(error = %err, "favicon commit failed, retrying next cycle");
            }
            if let Err(err) = favicons.begin_singleton_transaction() {
                warn!(error = %err, "favicon transaction begin failed");
            }
        }
    }

    /// Raze-and-recreate after catastrophic corruption. Nothing is
    /// committed; the damaged file is rebuilt empty and the embedder is told
    /// through `notify_profile_error`.
    pub fn kill_history_database(&mut self) {
        self.scheduled_kill_db = false;
        self.commit_deadline = None;
        if let Some(mut store) = self.store.take() {
            if let Err(err) = store.rollback_singleton_transaction() {
                warn!(error = %err, "rollback before raze failed");
            }
            match store.raze_and_reinit() {
                Ok(()) => {
                    if let Err(err) = store.begin_singleton_transaction() {
                        warn!(error = %err, "transaction begin after raze failed");
                    }
                    self.store = Some(store);
                }
                Err(err) => {
                    warn!(error = %err, "raze failed, history store disabled");
                }
            }
        }
        self.tracker.clear();
        self.recent_redirects.clear();
        self.first_recorded_time = None;
        self.delegate
            .notify_profile_error("history database corrupt; recreated empty");
    }

    // ============================================
    // QUEUED DB TASKS
    // ============================================

    pub fn schedule_db_task(&mut self, task: QueuedTask) {
        self.tasks.push(task);
    }

    /// Runs each currently queued task once; tasks reporting `NotDone` go to
    /// the back of the queue.
    pub fn process_queued_tasks(&mut self) {
        let pending = self.tasks.len();
        for _ in 0..pending {
            let Some(mut queued) = self.tasks.pop() else {
                break;
            };
            if (queued.is_canceled)() {
                continue;
            }
            match queued.task.run(self) {
                TaskStatus::Done => {}
                TaskStatus::NotDone => {
                    if !(queued.is_canceled)() {
                        self.tasks.push(queued);
                    }
                }
            }
        }
    }

    pub fn has_queued_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }
}

#[allow(clippy::too_many_arguments)]
fn add_page_visit_rows(
    store: &HistoryStore,
    url: &str,
    time: DateTime<Utc>,
    from_visit: VisitId,
    external_referrer: &str,
    transition: PageTransition,
    hidden: bool,
    source: VisitSource,
    typed_increment: bool,
    opener_visit: VisitId,
    consider_for_most_visited: bool,
    title: Option<&str>,
) -> anyhow::Result<(UrlRow, VisitRow)> {
    let url_row = match store.get_row_for_url(url)? {
        Some(mut row) => {
            // Reloads refresh the last-visit time without inflating counts.
            if !transition.core_type_is(CoreTransition::Reload) {
                row.visit_count += 1;
            }
            if typed_increment {
                row.typed_count += 1;
            }
            if row.last_visit.map_or(true, |last| last < time) {
                row.last_visit = Some(time);
            }
            if let Some(title) = title {
                if !title.is_empty() {
                    row.title = title.to_string();
                }
            }
            // Pages can be un-hidden by a visible visit, never re-hidden.
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
                title: title.unwrap_or("").to_string(),
                visit_count: 1,
                typed_count: if typed_increment { 1 } else { 0 },
                last_visit: Some(time),
                hidden,
            };
            row.id = store.add_url(&row)?;
            row
        }
    };

    let mut visit = VisitRow::new(url_row.id, time, from_visit, transition);
    visit.external_referrer_url = external_referrer.to_string();
    visit.opener_visit = opener_visit;
    visit.incremented_omnibox_typed_score = typed_increment;
    visit.consider_for_most_visited = consider_for_most_visited;
    store.add_visit(&mut visit, source)?;
    Ok((url_row, visit))
}

fn strip_trivial_subdomains(host: &str) -> &str {
    host.strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(host)
}

/// True when `to` is the https twin of the http URL `from`: same host after
/// dropping a leading `www.`/`m.` label, same path and query, port and
/// credentials ignored.
fn is_trivial_https_upgrade(from: &str, to: &str) -> bool {
    let (Ok(from), Ok(to)) = (Url::parse(from), Url::parse(to)) else {
        return false;
    };
    if from.scheme() != "http" || to.scheme() != "https" {
        return false;
    }
    let (Some(from_host), Some(to_host)) = (from.host_str(), to.host_str()) else {
        return false;
    };
    strip_trivial_subdomains(from_host) == strip_trivial_subdomains(to_host)
        && from.path() == to.path()
        && from.query() == to.query()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trivial_https_upgrade_detection() {
        assert!(is_trivial_https_upgrade("http://b.test/", "https://b.test/"));
        assert!(is_trivial_https_upgrade(
            "http://www.b.test/page?q=1",
            "https://b.test/page?q=1"
        ));
        assert!(is_trivial_https_upgrade(
            "http://b.test:80/",
            "https://b.test:443/"
        ));
        assert!(!is_trivial_https_upgrade("http://b.test/", "https://c.test/"));
        assert!(!is_trivial_https_upgrade("http://b.test/a", "https://b.test/b"));
        assert!(!is_trivial_https_upgrade("https://b.test/", "https://b.test/"));
    }

    #[test]
    fn test_strip_trivial_subdomains() {
        assert_eq!(strip_trivial_subdomains("www.example.com"), "example.com");
        assert_eq!(strip_trivial_subdomains("m.example.com"), "example.com");
        assert_eq!(strip_trivial_subdomains("maps.example.com"), "maps.example.com");
    }
}
