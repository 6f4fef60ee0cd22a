//! The read-only query surface of the engine.
//!
//! Every method degrades to an empty result when the store is unavailable
//! or a read fails; failures are logged and, when catastrophic, schedule a
//! raze.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use url::Url;

use super::{record_failure, strip_trivial_subdomains, HistoryBackend};
use crate::store::HistoryStore;
use crate::transition::Qualifiers;
use crate::types::{
    midnight_of, AnnotatedVisit, Cluster, ClusterId, ClusterVisit, DomainMetricBitmask,
    DomainMetricCount, DomainMetricSet, DuplicateClusterVisit, DuplicatePolicy,
    InteractionState, KeywordId, KeywordSearchTermVisit, LastVisitResult, MostVisitedUrl,
    QueryOptions, QueryResults, QueryUrlResult, UrlId, UrlResult, VisibleVisitCountToHost,
    VisitId, VisitRow, INVALID_CLUSTER_ID, INVALID_VISIT_ID,
};

/// URL prefixes covering both schemes and the optional `www.` label of a
/// host, for sort-order range scans over the urls table.
fn host_prefixes(host: &str) -> Vec<String> {
    let mut prefixes = Vec::with_capacity(4);
    for scheme in ["http", "https"] {
        prefixes.push(format!("{scheme}://{host}/"));
        prefixes.push(format!("{scheme}://www.{host}/"));
    }
    prefixes
}

fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(strip_trivial_subdomains(host).to_string())
}

impl HistoryBackend {
    // ============================================
    // URL & HISTORY QUERIES
    // ============================================

    pub fn query_url(&mut self, url: &str, want_visits: bool) -> Option<QueryUrlResult> {
        let Some(store) = self.store.as_ref() else {
            return None;
        };
        let outcome = (|| -> anyhow::Result<Option<QueryUrlResult>> {
            let Some(row) = store.get_row_for_url(url)? else {
                return Ok(None);
            };
            let visits = if want_visits {
                store.get_visits_for_url(row.id)?
            } else {
                Vec::new()
            };
            Ok(Some(QueryUrlResult { row, visits }))
        })();
        match outcome {
            Ok(result) => result,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "query_url", &err);
                None
            }
        }
    }

    /// Reverse-chronological browse or text query over visible visits.
    /// Duplicate visits to the same URL collapse per the options' policy.
    pub fn query_history(&mut self, text_query: Option<&str>, options: &QueryOptions) -> QueryResults {
        let Some(store) = self.store.as_ref() else {
            return QueryResults::default();
        };
        let first_recorded = self.first_recorded_time;
        let outcome = (|| -> anyhow::Result<QueryResults> {
            let max = options.effective_max_count();
            let visits =
                store.get_visible_visits_in_range(options.begin_time, options.end_time, 0)?;

            let matching_ids: Option<HashSet<UrlId>> = match text_query {
                Some(query) if !options.host_only => {
                    let terms: Vec<String> = query
                        .split_whitespace()
                        .map(|t| t.to_lowercase())
                        .collect();
                    Some(store.get_text_matching_url_ids(&terms)?.into_iter().collect())
                }
                _ => None,
            };
            let host_filter = if options.host_only {
                text_query.map(|q| q.trim().to_lowercase())
            } else {
                None
            };

            let mut url_rows: HashMap<UrlId, crate::types::UrlRow> = HashMap::new();
            let mut seen: HashSet<(UrlId, i64)> = HashSet::new();
            let mut results = Vec::new();
            let mut truncated = false;
            for visit in &visits {
                if results.len() >= max {
                    truncated = true;
                    break;
                }
                if let Some(ids) = &matching_ids {
                    if !ids.contains(&visit.url_id) {
                        continue;
                    }
                }
                let row = match url_rows.get(&visit.url_id) {
                    Some(row) => row.clone(),
                    None => {
                        let Some(row) = store.get_url_row(visit.url_id)? else {
                            continue;
                        };
                        url_rows.insert(visit.url_id, row.clone());
                        row
                    }
                };
                if let Some(host) = &host_filter {
                    match domain_of(&row.url) {
                        Some(domain) if domain == strip_trivial_subdomains(host) => {}
                        _ => continue,
                    }
                }
                let dedupe_key = match options.duplicate_policy {
                    DuplicatePolicy::RemoveAll => Some((visit.url_id, 0)),
                    DuplicatePolicy::RemovePerDay => Some((
                        visit.url_id,
                        midnight_of(visit.visit_time).timestamp(),
                    )),
                    DuplicatePolicy::KeepAll => None,
                };
                if let Some(key) = dedupe_key {
                    if !seen.insert(key) {
                        continue;
                    }
                }
                let content_annotations = store.get_content_annotations_for_visit(visit.id)?;
                results.push(UrlResult {
                    row,
                    visit_time: visit.visit_time,
                    content_annotations,
                });
            }

            let reached_beginning = !truncated
                && options
                    .begin_time
                    .map_or(true, |b| first_recorded.map_or(true, |f| b <= f));
            Ok(QueryResults {
                results,
                reached_beginning,
            })
        })();
        match outcome {
            Ok(results) => results,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "query_history", &err);
                QueryResults::default()
            }
        }
    }

    /// Top sites by decayed segment score: each day bucket contributes its
    /// visit count divided by one plus its age in days.
    pub fn query_most_visited_urls(&mut self, count: usize, now: DateTime<Utc>) -> Vec<MostVisitedUrl> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let outcome = (|| -> anyhow::Result<Vec<MostVisitedUrl>> {
            let since = now - Duration::days(90);
            let usage = store.get_segment_usage_since(since)?;
            let mut scores: HashMap<i64, (UrlId, f64)> = HashMap::new();
            for row in usage {
                let days_ago = (now - row.time_slot).num_days().max(0);
                let entry = scores.entry(row.segment_id).or_insert((row.url_id, 0.0));
                entry.1 += row.visit_count as f64 / (1.0 + days_ago as f64);
            }
            let mut ranked = Vec::new();
            for (_, (url_id, score)) in scores {
                let Some(row) = store.get_url_row(url_id)? else {
                    continue;
                };
                ranked.push(MostVisitedUrl {
                    url: row.url,
                    title: row.title,
                    visit_count: row.visit_count,
                    last_visit_time: row.last_visit,
                    score,
                });
            }
            ranked.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            ranked.truncate(count);
            Ok(ranked)
        })();
        match outcome {
            Ok(ranked) => ranked,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "query_most_visited_urls", &err);
                Vec::new()
            }
        }
    }

    // ============================================
    // REDIRECT QUERIES
    // ============================================

    /// URLs the most recent visit to `url` redirected onward to, in order.
    pub fn query_redirects_from(&mut self, url: &str) -> Vec<String> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let outcome = (|| -> anyhow::Result<Vec<String>> {
            let Some(row) = store.get_row_for_url(url)? else {
                return Ok(Vec::new());
            };
            let Some(visit) = store.get_most_recent_visit_for_url(row.id)? else {
                return Ok(Vec::new());
            };
            let mut chain = Vec::new();
            let mut seen = HashSet::new();
            let mut current = visit.id;
            while seen.insert(current) {
                match store.get_redirect_from_visit(current)? {
                    Some((next_id, next_url)) => {
                        chain.push(next_url);
                        current = next_id;
                    }
                    None => break,
                }
            }
            Ok(chain)
        })();
        match outcome {
            Ok(chain) => chain,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "query_redirects_from", &err);
                Vec::new()
            }
        }
    }

    /// URLs that redirected into the most recent visit to `url`, nearest
    /// first.
    pub fn query_redirects_to(&mut self, url: &str) -> Vec<String> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let outcome = (|| -> anyhow::Result<Vec<String>> {
            let Some(row) = store.get_row_for_url(url)? else {
                return Ok(Vec::new());
            };
            let Some(visit) = store.get_most_recent_visit_for_url(row.id)? else {
                return Ok(Vec::new());
            };
            let mut chain = Vec::new();
            let mut seen = HashSet::new();
            let mut current = visit.id;
            while seen.insert(current) {
                match store.get_redirect_to_visit(current)? {
                    Some((prev_id, prev_url)) => {
                        chain.push(prev_url);
                        current = prev_id;
                    }
                    None => break,
                }
            }
            Ok(chain)
        })();
        match outcome {
            Ok(chain) => chain,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "query_redirects_to", &err);
                Vec::new()
            }
        }
    }

    /// The full chain containing `visit`, ordered start to end. Empty when
    /// the chain is broken or cyclic.
    pub fn get_redirect_chain(&mut self, visit: VisitRow) -> Vec<VisitRow> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        match redirect_chain(store, visit) {
            Ok(chain) => chain,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_redirect_chain", &err);
                Vec::new()
            }
        }
    }

    pub fn get_redirect_chain_start(&mut self, visit: VisitRow) -> Option<VisitRow> {
        self.get_redirect_chain(visit).into_iter().next()
    }

    // ============================================
    // COUNTS & METRICS
    // ============================================

    /// Number of distinct (URL, day) pairs with a visible visit in the
    /// range.
    pub fn get_history_count(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        match store.get_history_count(begin, end) {
            Ok(count) => count,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_history_count", &err);
                0
            }
        }
    }

    pub fn count_unique_hosts_visited_last_month(&mut self, now: DateTime<Utc>) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        let outcome = (|| -> anyhow::Result<usize> {
            let urls = store.get_urls_visited_in_range(now - Duration::days(30), now, true)?;
            let hosts: HashSet<String> = urls
                .iter()
                .filter_map(|url| Url::parse(url).ok()?.host_str().map(str::to_string))
                .collect();
            Ok(hosts.len())
        })();
        match outcome {
            Ok(count) => count,
            Err(err) => {
                record_failure(
                    &mut self.scheduled_kill_db,
                    "count_unique_hosts_visited_last_month",
                    &err,
                );
                0
            }
        }
    }

    /// Unique-domain counts for trailing windows ending at each of the last
    /// `number_of_days_to_report` midnights (capped by configuration).
    pub fn get_domain_diversity(
        &mut self,
        report_time: DateTime<Utc>,
        number_of_days_to_report: usize,
        metric_type_bitmask: DomainMetricBitmask,
    ) -> Vec<DomainMetricSet> {
        let cap = self.config.backend.domain_diversity_max_backtracked_days.max(0) as usize;
        let days = number_of_days_to_report.min(cap);
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let outcome = (|| -> anyhow::Result<Vec<DomainMetricSet>> {
            let mut sets = Vec::with_capacity(days);
            for day in 0..days {
                let end_time = midnight_of(report_time) - Duration::days(day as i64);
                let count_for = |window_days: i64| -> anyhow::Result<DomainMetricCount> {
                    let begin_time = end_time - Duration::days(window_days);
                    let urls = store.get_urls_visited_in_range(begin_time, end_time, true)?;
                    let domains: HashSet<String> =
                        urls.iter().filter_map(|url| domain_of(url)).collect();
                    Ok(DomainMetricCount {
                        count: domains.len(),
                        begin_time,
                    })
                };
                sets.push(DomainMetricSet {
                    end_time,
                    one_day: if metric_type_bitmask.contains(DomainMetricBitmask::LAST_1_DAY) {
                        Some(count_for(1)?)
                    } else {
                        None
                    },
                    seven_day: if metric_type_bitmask.contains(DomainMetricBitmask::LAST_7_DAY) {
                        Some(count_for(7)?)
                    } else {
                        None
                    },
                    twenty_eight_day: if metric_type_bitmask
                        .contains(DomainMetricBitmask::LAST_28_DAY)
                    {
                        Some(count_for(28)?)
                    } else {
                        None
                    },
                });
            }
            Ok(sets)
        })();
        match outcome {
            Ok(sets) => sets,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_domain_diversity", &err);
                Vec::new()
            }
        }
    }

    pub fn get_last_visit_to_host(
        &mut self,
        host: &str,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> LastVisitResult {
        self.last_visit_to_prefixes(&host_prefixes(host), begin, end)
    }

    /// Exact-origin variant; the origin string carries its scheme and
    /// optional port.
    pub fn get_last_visit_to_origin(
        &mut self,
        origin: &str,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> LastVisitResult {
        let prefix = if origin.ends_with('/') {
            origin.to_string()
        } else {
            format!("{origin}/")
        };
        self.last_visit_to_prefixes(&[prefix], begin, end)
    }

    fn last_visit_to_prefixes(
        &mut self,
        prefixes: &[String],
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> LastVisitResult {
        let Some(store) = self.store.as_ref() else {
            return LastVisitResult {
                success: false,
                last_visit: None,
            };
        };
        match store.get_last_visit_to_url_prefixes(prefixes, begin, end) {
            Ok(last_visit) => LastVisitResult {
                success: true,
                last_visit,
            },
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_last_visit_to_host", &err);
                LastVisitResult {
                    success: false,
                    last_visit: None,
                }
            }
        }
    }

    pub fn get_last_visit_to_url(&mut self, url: &str, end: Option<DateTime<Utc>>) -> LastVisitResult {
        let Some(store) = self.store.as_ref() else {
            return LastVisitResult {
                success: false,
                last_visit: None,
            };
        };
        match store.get_last_visit_to_url(url, end) {
            Ok(last_visit) => LastVisitResult {
                success: true,
                last_visit,
            },
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_last_visit_to_url", &err);
                LastVisitResult {
                    success: false,
                    last_visit: None,
                }
            }
        }
    }

    pub fn get_visible_visit_count_to_host(&mut self, host: &str) -> Option<VisibleVisitCountToHost> {
        let Some(store) = self.store.as_ref() else {
            return None;
        };
        match store.get_visible_visit_count_to_url_prefixes(&host_prefixes(host)) {
            Ok(counts) => Some(counts),
            Err(err) => {
                record_failure(
                    &mut self.scheduled_kill_db,
                    "get_visible_visit_count_to_host",
                    &err,
                );
                None
            }
        }
    }

    /// Visit count and last-visit time per origin, in one pass.
    pub fn get_counts_and_last_visit_for_origins(
        &mut self,
        origins: &[String],
    ) -> HashMap<String, (i64, Option<DateTime<Utc>>)> {
        let Some(store) = self.store.as_ref() else {
            return HashMap::new();
        };
        let mut counts = HashMap::with_capacity(origins.len());
        for origin in origins {
            let prefix = if origin.ends_with('/') {
                origin.clone()
            } else {
                format!("{origin}/")
            };
            match store.get_count_and_last_visit_for_prefixes(std::slice::from_ref(&prefix)) {
                Ok(result) => {
                    counts.insert(origin.clone(), result);
                }
                Err(err) => {
                    record_failure(
                        &mut self.scheduled_kill_db,
                        "get_counts_and_last_visit_for_origins",
                        &err,
                    );
                    return HashMap::new();
                }
            }
        }
        counts
    }

    // ============================================
    // ANNOTATED VISITS & CLUSTERS
    // ============================================

    /// Visible visits in the options' range, enriched with annotations,
    /// source, and the chain-start linkage consumers need to stitch chains
    /// back together.
    pub fn get_annotated_visits(&mut self, options: &QueryOptions) -> Vec<AnnotatedVisit> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let outcome = (|| -> anyhow::Result<Vec<AnnotatedVisit>> {
            let visits = store.get_visible_visits_in_range(
                options.begin_time,
                options.end_time,
                options.max_count,
            )?;
            let mut annotated = Vec::with_capacity(visits.len());
            for visit in visits {
                let Some(result) = annotated_visit(store, visit)? else {
                    continue;
                };
                annotated.push(result);
            }
            Ok(annotated)
        })();
        match outcome {
            Ok(annotated) => annotated,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_annotated_visits", &err);
                Vec::new()
            }
        }
    }

    /// Atomically (within the current commit window) deletes `ids_to_delete`
    /// and inserts `clusters`, returning the ids assigned to the inserted
    /// clusters in order.
    pub fn replace_clusters(
        &mut self,
        ids_to_delete: &[ClusterId],
        clusters: &[Cluster],
    ) -> Vec<ClusterId> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let outcome = (|| -> anyhow::Result<Vec<ClusterId>> {
            for id in ids_to_delete {
                store.delete_cluster(*id)?;
            }
            let mut new_ids = Vec::with_capacity(clusters.len());
            for cluster in clusters {
                let id = store.add_cluster(
                    &cluster.keywords,
                    &cluster.originator_cache_guid,
                    cluster.originator_cluster_id,
                )?;
                for visit in &cluster.visits {
                    add_cluster_visit(store, id, visit)?;
                }
                new_ids.push(id);
            }
            Ok(new_ids)
        })();
        match outcome {
            Ok(new_ids) => {
                self.schedule_commit();
                new_ids
            }
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "replace_clusters", &err);
                Vec::new()
            }
        }
    }

    /// Creates an empty cluster seeded with one visit, reserving its id for
    /// later additions.
    pub fn reserve_next_cluster_id_with_visit(&mut self, visit: &ClusterVisit) -> ClusterId {
        let Some(store) = self.store.as_ref() else {
            return INVALID_CLUSTER_ID;
        };
        let outcome = (|| -> anyhow::Result<ClusterId> {
            let id = store.add_cluster(&[], "", INVALID_CLUSTER_ID)?;
            add_cluster_visit(store, id, visit)?;
            Ok(id)
        })();
        match outcome {
            Ok(id) => {
                self.schedule_commit();
                id
            }
            Err(err) => {
                record_failure(
                    &mut self.scheduled_kill_db,
                    "reserve_next_cluster_id_with_visit",
                    &err,
                );
                INVALID_CLUSTER_ID
            }
        }
    }

    pub fn add_visits_to_cluster(&mut self, cluster_id: ClusterId, visits: &[ClusterVisit]) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            for visit in visits {
                add_cluster_visit(store, cluster_id, visit)?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "add_visits_to_cluster", &err)
            }
        }
    }

    pub fn get_most_recent_clusters(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        max_clusters: usize,
    ) -> Vec<Cluster> {
        let ids = {
            let Some(store) = self.store.as_ref() else {
                return Vec::new();
            };
            match store.get_most_recent_cluster_ids(begin, end, max_clusters) {
                Ok(ids) => ids,
                Err(err) => {
                    record_failure(
                        &mut self.scheduled_kill_db,
                        "get_most_recent_clusters",
                        &err,
                    );
                    return Vec::new();
                }
            }
        };
        ids.into_iter()
            .filter_map(|id| self.get_cluster(id))
            .collect()
    }

    pub fn get_cluster(&mut self, cluster_id: ClusterId) -> Option<Cluster> {
        let Some(store) = self.store.as_ref() else {
            return None;
        };
        let outcome = (|| -> anyhow::Result<Option<Cluster>> {
            let Some((keywords, originator_cache_guid, originator_cluster_id)) =
                store.get_cluster_row(cluster_id)?
            else {
                return Ok(None);
            };
            let mut visits = Vec::new();
            for (visit_id, score, interaction_state) in store.get_visits_in_cluster(cluster_id)? {
                let Some(visit_row) = store.get_row_for_visit(visit_id)? else {
                    continue;
                };
                let Some(annotated) = annotated_visit(store, visit_row)? else {
                    continue;
                };
                let mut duplicate_visits = Vec::new();
                for dup_id in store.get_duplicate_visit_ids(visit_id)? {
                    let Some(dup) = store.get_row_for_visit(dup_id)? else {
                        continue;
                    };
                    let Some(dup_url) = store.get_url_row(dup.url_id)? else {
                        continue;
                    };
                    duplicate_visits.push(DuplicateClusterVisit {
                        visit_id: dup_id,
                        url: dup_url.url,
                        visit_time: dup.visit_time,
                    });
                }
                visits.push(ClusterVisit {
                    annotated_visit: annotated,
                    score,
                    interaction_state,
                    duplicate_visits,
                });
            }
            Ok(Some(Cluster {
                cluster_id,
                visits,
                keywords,
                originator_cache_guid,
                originator_cluster_id,
            }))
        })();
        match outcome {
            Ok(cluster) => cluster,
            Err(err) => {
                record_failure(&mut self.scheduled_kill_db, "get_cluster", &err);
                None
            }
        }
    }

    pub fn get_cluster_id_containing_visit(&mut self, visit_id: VisitId) -> Option<ClusterId> {
        let Some(store) = self.store.as_ref() else {
            return None;
        };
        match store.get_cluster_id_containing_visit(visit_id) {
            Ok(id) => id,
            Err(err) => {
                record_failure(
                    &mut self.scheduled_kill_db,
                    "get_cluster_id_containing_visit",
                    &err,
                );
                None
            }
        }
    }

    pub fn update_visits_interaction_state(
        &mut self,
        visit_ids: &[VisitId],
        state: InteractionState,
    ) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let outcome = (|| -> anyhow::Result<()> {
            for visit_id in visit_ids {
                store.update_cluster_visit_interaction_state(*visit_id, state)?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => self.schedule_commit(),
            Err(err) => record_failure(
                &mut self.scheduled_kill_db,
                "update_visits_interaction_state",
                &err,
            ),
        }
    }

    /// Hides visits from cluster surfaces without deleting them from
    /// history.
    pub fn hide_visits(&mut self, visit_ids: &[VisitId]) {
        self.update_visits_interaction_state(visit_ids, InteractionState::Hidden);
    }

    // ============================================
    // KEYWORD SEARCH TERM QUERIES
    // ============================================

    /// Terms for a keyword starting with the prefix, most recent first.
    pub fn get_most_recent_keyword_search_terms(
        &mut self,
        keyword_id: KeywordId,
        prefix: &str,
        max_count: usize,
    ) -> Vec<KeywordSearchTermVisit> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        match store.get_most_recent_keyword_search_terms(keyword_id, prefix, max_count) {
            Ok(terms) => terms,
            Err(err) => {
                record_failure(
                    &mut self.scheduled_kill_db,
                    "get_most_recent_keyword_search_terms",
                    &err,
                );
                Vec::new()
            }
        }
    }

    /// Terms for a keyword ranked by total visit count, normalized variants
    /// aggregated together.
    pub fn query_most_repeated_queries_for_keyword(
        &mut self,
        keyword_id: KeywordId,
        result_count: usize,
    ) -> Vec<KeywordSearchTermVisit> {
        let terms = self.get_most_recent_keyword_search_terms(keyword_id, "", 0);
        let mut aggregated: HashMap<String, KeywordSearchTermVisit> = HashMap::new();
        for term in terms {
            let key = crate::store::normalize_search_term(&term.term);
            match aggregated.get_mut(&key) {
                Some(existing) => {
                    existing.visit_count += term.visit_count;
                    if term.last_visit_time > existing.last_visit_time {
                        existing.last_visit_time = term.last_visit_time;
                    }
                }
                None => {
                    aggregated.insert(key, term);
                }
            }
        }
        let mut ranked: Vec<KeywordSearchTermVisit> = aggregated.into_values().collect();
        ranked.sort_by(|a, b| {
            b.visit_count
                .cmp(&a.visit_count)
                .then(b.last_visit_time.cmp(&a.last_visit_time))
        });
        ranked.truncate(result_count);
        ranked
    }
}

/// Walks back to the chain start, then returns the chain in order. Broken
/// links and cycles yield an empty chain.
fn redirect_chain(store: &HistoryStore, visit: VisitRow) -> anyhow::Result<Vec<VisitRow>> {
    let mut chain = vec![visit];
    let mut seen: HashSet<VisitId> = chain.iter().map(|v| v.id).collect();
    loop {
        let first = &chain[0];
        if first.transition.has(Qualifiers::CHAIN_START)
            || first.referring_visit == INVALID_VISIT_ID
        {
            break;
        }
        let Some(prev) = store.get_row_for_visit(first.referring_visit)? else {
            return Ok(Vec::new());
        };
        if !seen.insert(prev.id) {
            return Ok(Vec::new());
        }
        chain.insert(0, prev);
    }
    Ok(chain)
}

fn annotated_visit(store: &HistoryStore, visit: VisitRow) -> anyhow::Result<Option<AnnotatedVisit>> {
    let Some(url_row) = store.get_url_row(visit.url_id)? else {
        return Ok(None);
    };
    let context_annotations = store
        .get_context_annotations_for_visit(visit.id)?
        .unwrap_or_default();
    let content_annotations = store
        .get_content_annotations_for_visit(visit.id)?
        .unwrap_or_default();
    let source = store.get_visit_source(visit.id)?;
    let chain = redirect_chain(store, visit.clone())?;
    let (chain_referrer, chain_opener) = chain
        .first()
        .map(|start| (start.referring_visit, start.opener_visit))
        .unwrap_or((INVALID_VISIT_ID, INVALID_VISIT_ID));
    Ok(Some(AnnotatedVisit {
        url_row,
        visit_row: visit,
        context_annotations,
        content_annotations,
        referring_visit_of_redirect_chain_start: chain_referrer,
        opener_visit_of_redirect_chain_start: chain_opener,
        source,
    }))
}

fn add_cluster_visit(
    store: &HistoryStore,
    cluster_id: ClusterId,
    visit: &ClusterVisit,
) -> anyhow::Result<()> {
    let visit_id = visit.annotated_visit.visit_row.id;
    store.add_visit_to_cluster(cluster_id, visit_id, visit.score, visit.interaction_state)?;
    for duplicate in &visit.duplicate_visits {
        store.add_cluster_visit_duplicate(visit_id, duplicate.visit_id)?;
    }
    Ok(())
}
