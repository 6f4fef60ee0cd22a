//! End-to-end tests exercising the engine against file-backed databases.

use chrono::{Duration, TimeZone, Utc};
use std::time::{Duration as StdDuration, Instant};
use tempfile::TempDir;

use hindsight::backend::{AddPageArgs, HistoryBackend};
use hindsight::config::Config;
use hindsight::delegate::NoopDelegate;
use hindsight::store::HistoryStore;
use hindsight::transition::{CoreTransition, PageTransition, Qualifiers};
use hindsight::types::{QueryOptions, VisitRow, INVALID_SEGMENT_ID, INVALID_VISIT_ID};

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.database.history_path = dir
        .path()
        .join("history.db")
        .to_string_lossy()
        .into_owned();
    config.database.favicons_path = dir
        .path()
        .join("favicons.db")
        .to_string_lossy()
        .into_owned();
    config
}

fn open_backend(dir: &TempDir) -> HistoryBackend {
    HistoryBackend::open(test_config(dir), Box::new(NoopDelegate))
}

fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, hour, minute, 0).unwrap()
}

fn typed(url: &str, time: chrono::DateTime<Utc>) -> AddPageArgs {
    AddPageArgs::new(url, time, PageTransition::new(CoreTransition::Typed))
}

fn link(url: &str, time: chrono::DateTime<Utc>) -> AddPageArgs {
    AddPageArgs::new(url, time, PageTransition::new(CoreTransition::Link))
}

#[test]
fn test_visit_counts_accumulate_without_merging() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(typed("https://news.site/", at(9, 0)));
    backend.add_page(link("https://news.site/", at(9, 5)));
    backend.add_page(link("https://news.site/", at(9, 10)));

    let result = backend.query_url("https://news.site/", true).unwrap();
    assert_eq!(result.row.visit_count, 3);
    assert_eq!(result.row.typed_count, 1);
    assert_eq!(result.visits.len(), 3);
    assert_eq!(result.row.last_visit, Some(at(9, 10)));
}

#[test]
fn test_reload_refreshes_last_visit_without_counting() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(link("https://news.site/", at(9, 0)));
    backend.add_page(AddPageArgs::new(
        "https://news.site/",
        at(9, 5),
        PageTransition::new(CoreTransition::Reload),
    ));

    let result = backend.query_url("https://news.site/", true).unwrap();
    assert_eq!(result.row.visit_count, 1);
    assert_eq!(result.row.last_visit, Some(at(9, 5)));
    // The reload still records its own visit row
    assert_eq!(result.visits.len(), 2);
}

#[test]
fn test_redirect_chain_rows_and_boundaries() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    let mut args = typed("https://dest.site/home", at(10, 0));
    args.redirects = vec![
        "https://start.site/".to_string(),
        "https://mid.site/".to_string(),
        "https://dest.site/home".to_string(),
    ];
    backend.add_page(args);

    let start = backend.query_url("https://start.site/", true).unwrap();
    let mid = backend.query_url("https://mid.site/", true).unwrap();
    let dest = backend.query_url("https://dest.site/home", true).unwrap();

    let start_visit = &start.visits[0];
    let mid_visit = &mid.visits[0];
    let dest_visit = &dest.visits[0];

    // Exactly one chain start and one chain end across the chain
    assert!(start_visit.transition.has(Qualifiers::CHAIN_START));
    assert!(!start_visit.transition.has(Qualifiers::CHAIN_END));
    assert!(!mid_visit.transition.has(Qualifiers::CHAIN_START));
    assert!(!mid_visit.transition.has(Qualifiers::CHAIN_END));
    assert!(!dest_visit.transition.has(Qualifiers::CHAIN_START));
    assert!(dest_visit.transition.has(Qualifiers::CHAIN_END));

    // Interior hops carry the server-redirect bit and link back in order
    assert!(mid_visit.transition.has(Qualifiers::SERVER_REDIRECT));
    assert!(dest_visit.transition.has(Qualifiers::SERVER_REDIRECT));
    assert_eq!(start_visit.referring_visit, INVALID_VISIT_ID);
    assert_eq!(mid_visit.referring_visit, start_visit.id);
    assert_eq!(dest_visit.referring_visit, mid_visit.id);

    // All rows share the navigation timestamp
    assert_eq!(start_visit.visit_time, at(10, 0));
    assert_eq!(dest_visit.visit_time, at(10, 0));

    // Typed credit lands on the chain start (no https upgrade here)
    assert_eq!(start.row.typed_count, 1);
    assert_eq!(mid.row.typed_count, 0);
    assert_eq!(dest.row.typed_count, 0);

    assert_eq!(
        backend.query_redirects_from("https://start.site/"),
        vec![
            "https://mid.site/".to_string(),
            "https://dest.site/home".to_string()
        ]
    );
    assert_eq!(
        backend.query_redirects_to("https://dest.site/home"),
        vec![
            "https://mid.site/".to_string(),
            "https://start.site/".to_string()
        ]
    );
}

#[test]
fn test_typed_credit_moves_across_https_upgrade() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    let mut args = typed("https://bank.test/login", at(10, 0));
    args.redirects = vec![
        "http://bank.test/".to_string(),
        "https://bank.test/".to_string(),
        "https://bank.test/login".to_string(),
    ];
    backend.add_page(args);

    let plain = backend.query_url("http://bank.test/", false).unwrap();
    let secure = backend.query_url("https://bank.test/", false).unwrap();
    let login = backend.query_url("https://bank.test/login", false).unwrap();

    assert_eq!(plain.row.typed_count, 0);
    assert_eq!(secure.row.typed_count, 1);
    assert_eq!(login.row.typed_count, 0);
    // All three rows still exist with one visit each
    assert_eq!(plain.row.visit_count, 1);
    assert_eq!(secure.row.visit_count, 1);
    assert_eq!(login.row.visit_count, 1);
}

#[test]
fn test_untyped_intranet_host_upgraded_once() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(link("http://wiki/", at(9, 0)));
    let first = backend.query_url("http://wiki/", true).unwrap();
    assert_eq!(first.row.typed_count, 1);
    assert!(first.visits[0]
        .transition
        .core_type_is(CoreTransition::Typed));

    // A typed row now exists for the host, so later links stay links
    backend.add_page(link("http://wiki/", at(9, 5)));
    let second = backend.query_url("http://wiki/", true).unwrap();
    assert_eq!(second.row.typed_count, 1);
    assert!(second.visits[1].transition.core_type_is(CoreTransition::Link));

    // Dotted hosts are never upgraded
    backend.add_page(link("http://wiki.corp.test/", at(9, 10)));
    let dotted = backend.query_url("http://wiki.corp.test/", false).unwrap();
    assert_eq!(dotted.row.typed_count, 0);
}

#[test]
fn test_query_history_text_and_dedupe() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    let mut args = link("https://recipes.test/bread", at(8, 0));
    args.title = Some("Sourdough bread".to_string());
    backend.add_page(args);
    backend.add_page(link("https://recipes.test/bread", at(12, 0)));
    backend.add_page(link("https://other.test/", at(13, 0)));

    let all = backend.query_history(None, &QueryOptions::default());
    // RemoveAll keeps one entry per URL, newest first
    assert_eq!(all.results.len(), 2);
    assert_eq!(all.results[0].row.url, "https://other.test/");
    assert_eq!(all.results[1].visit_time, at(12, 0));
    assert!(all.reached_beginning);

    let matched = backend.query_history(Some("sourdough"), &QueryOptions::default());
    assert_eq!(matched.results.len(), 1);
    assert_eq!(matched.results[0].row.url, "https://recipes.test/bread");

    let none = backend.query_history(Some("quiche"), &QueryOptions::default());
    assert!(none.results.is_empty());
}

#[test]
fn test_most_visited_prefers_frequent_recent_segments() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    for minute in 0..3 {
        backend.add_page(typed("https://daily.test/", at(9, minute)));
    }
    backend.add_page(typed("https://rare.test/", at(9, 30)));

    let now = at(18, 0);
    let top = backend.query_most_visited_urls(10, now);
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].url, "https://daily.test/");
    assert!(top[0].score > top[1].score);
}

#[test]
fn test_commit_batching_and_privacy_flush() {
    let dir = TempDir::new().unwrap();
    let history_path = dir.path().join("history.db");
    let mut backend = open_backend(&dir);
    // Second connection opened before the engine takes its write lock
    let reader = HistoryStore::open(&history_path).unwrap();

    backend.add_page(link("https://a.test/", at(9, 0)));
    backend.add_page(link("https://b.test/", at(9, 1)));
    assert!(backend.has_pending_commit());

    // Uncommitted rows are invisible to the second connection
    assert!(reader.get_row_for_url("https://a.test/").unwrap().is_none());

    // Before the batching window elapses nothing commits
    backend.tick(Instant::now());
    assert!(backend.has_pending_commit());

    backend.tick(Instant::now() + StdDuration::from_secs(11));
    assert!(!backend.has_pending_commit());
    assert!(reader.get_row_for_url("https://a.test/").unwrap().is_some());
    assert!(reader.get_row_for_url("https://b.test/").unwrap().is_some());

    // A privacy-sensitive deletion flushes synchronously
    backend.delete_url("https://a.test/");
    assert!(!backend.has_pending_commit());
    assert!(reader.get_row_for_url("https://a.test/").unwrap().is_none());
}

#[test]
fn test_delete_url_is_immediately_observable() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(typed("https://gone.test/", at(9, 0)));
    assert!(backend.query_url("https://gone.test/", false).is_some());

    backend.delete_url("https://gone.test/");
    assert!(backend.query_url("https://gone.test/", false).is_none());
    let results = backend.query_history(None, &QueryOptions::default());
    assert!(results.results.is_empty());
}

#[test]
fn test_expire_history_between_keeps_other_visits() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(link("https://old.test/", at(8, 0)));
    backend.add_page(link("https://kept.test/", at(12, 0)));

    backend.expire_history_between(Some(at(7, 0)), Some(at(9, 0)), &[]);

    assert!(backend.query_url("https://old.test/", false).is_none());
    assert!(backend.query_url("https://kept.test/", false).is_some());
}

#[test]
fn test_set_page_title_covers_redirect_chain() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    let mut args = link("https://dest.test/", at(9, 0));
    args.redirects = vec![
        "https://src.test/".to_string(),
        "https://dest.test/".to_string(),
    ];
    backend.add_page(args);
    backend.set_page_title("https://dest.test/", "Landing");

    let src = backend.query_url("https://src.test/", false).unwrap();
    let dest = backend.query_url("https://dest.test/", false).unwrap();
    assert_eq!(src.row.title, "Landing");
    assert_eq!(dest.row.title, "Landing");
}

fn foreign_visit(guid: &str, originator_id: i64, time: chrono::DateTime<Utc>) -> VisitRow {
    let transition = PageTransition::with(
        CoreTransition::Link,
        Qualifiers::CHAIN_START | Qualifiers::CHAIN_END,
    );
    let mut visit = VisitRow::new(0, time, INVALID_VISIT_ID, transition);
    visit.originator_cache_guid = guid.to_string();
    visit.originator_visit_id = originator_id;
    visit.is_known_to_sync = true;
    visit
}

#[test]
fn test_foreign_visit_sweep_deletes_in_batches_and_spares_new_visits() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.sync.foreign_visits_to_delete_per_batch = 2;
    let mut backend = HistoryBackend::open(config, Box::new(NoopDelegate));

    for i in 0..5 {
        let id = backend.add_synced_visit(
            &format!("https://phone.test/{i}"),
            "",
            false,
            foreign_visit("device-a", 100 + i, at(9, i as u32)),
            None,
            None,
        );
        assert_ne!(id, INVALID_VISIT_ID);
    }

    backend.delete_all_foreign_visits_and_reset_is_known_to_sync();
    assert!(backend.has_queued_tasks());

    // A visit synced after the sweep started lies above the watermark
    let survivor = backend.add_synced_visit(
        "https://phone.test/late",
        "",
        false,
        foreign_visit("device-a", 999, at(10, 0)),
        None,
        None,
    );
    assert_ne!(survivor, INVALID_VISIT_ID);

    let mut rounds = 0;
    while backend.has_queued_tasks() {
        backend.process_queued_tasks();
        rounds += 1;
        assert!(rounds < 10, "sweep failed to terminate");
    }
    // 5 visits at batch size 2 need three batches
    assert_eq!(rounds, 3);

    for i in 0..5 {
        assert!(backend.get_foreign_visit("device-a", 100 + i).is_none());
        assert!(backend
            .query_url(&format!("https://phone.test/{i}"), false)
            .is_none());
    }
    assert!(backend.get_foreign_visit("device-a", 999).is_some());
    assert!(backend
        .query_url("https://phone.test/late", false)
        .is_some());
}

#[test]
fn test_synced_visit_update_preserves_local_identity() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    let original = foreign_visit("device-b", 7, at(9, 0));
    let local_id = backend.add_synced_visit(
        "https://phone.test/a",
        "",
        false,
        original.clone(),
        None,
        None,
    );
    assert_ne!(local_id, INVALID_VISIT_ID);

    let mut updated = original;
    updated.visit_duration = Duration::seconds(42);
    let result = backend.update_synced_visit(updated, None, None);
    assert_eq!(result, local_id);

    // A guid mismatch is silently ignored
    let mut stranger = foreign_visit("device-c", 7, at(9, 0));
    stranger.visit_duration = Duration::seconds(1);
    assert_eq!(backend.update_synced_visit(stranger, None, None), INVALID_VISIT_ID);
}

#[test]
fn test_referrer_resolution_moves_visit_into_ancestor_segment() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);
    let reader = HistoryStore::open(&dir.path().join("history.db")).unwrap();
    backend.set_foreign_segment_policy(Box::new(|_| true));

    let mut opener = foreign_visit("device-d", 1, at(9, 0));
    opener.transition = PageTransition::with(
        CoreTransition::Typed,
        Qualifiers::CHAIN_START | Qualifiers::CHAIN_END,
    );
    let a = backend.add_synced_visit("https://hub.test/", "", false, opener, None, None);
    assert_ne!(a, INVALID_VISIT_ID);

    // A link visit without a resolved referrer lands outside any segment
    let b = backend.add_synced_visit(
        "https://hub.test/article",
        "",
        false,
        foreign_visit("device-d", 2, at(9, 5)),
        None,
        None,
    );
    assert_ne!(b, INVALID_VISIT_ID);

    let a_segment = backend.query_url("https://hub.test/", true).unwrap().visits[0].segment_id;
    assert_ne!(a_segment, INVALID_SEGMENT_ID);
    let before = backend
        .query_url("https://hub.test/article", true)
        .unwrap()
        .visits[0]
        .segment_id;
    assert_eq!(before, INVALID_SEGMENT_ID);

    backend.update_visit_referrer_opener_ids(b, a, INVALID_VISIT_ID);

    let after = backend
        .query_url("https://hub.test/article", true)
        .unwrap()
        .visits[0]
        .clone();
    assert_eq!(after.referring_visit, a);
    assert_eq!(after.segment_id, a_segment);

    backend.commit();
    let usage = reader
        .get_segment_usage_since(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        .unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].segment_id, a_segment);
    assert_eq!(usage[0].visit_count, 2);
}

#[test]
fn test_segment_usage_counts_per_day_and_representative_url_refresh() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);
    let reader = HistoryStore::open(&dir.path().join("history.db")).unwrap();

    let day_two = |hour| Utc.with_ymd_and_hms(2024, 3, 15, hour, 0, 0).unwrap();

    backend.add_page(typed("https://shop.test/", at(9, 0)));
    backend.add_page(typed("https://shop.test/", at(11, 0)));
    backend.add_page(typed("https://www.shop.test/", day_two(10)));
    backend.commit();

    let plain = backend.query_url("https://shop.test/", false).unwrap().row;
    let www = backend.query_url("https://www.shop.test/", false).unwrap().row;
    assert_ne!(plain.id, www.id);

    let usage = reader
        .get_segment_usage_since(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        .unwrap();
    // Both hosts canonicalize to one segment with a counter row per day
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].segment_id, usage[1].segment_id);
    assert_eq!(
        usage[0].time_slot,
        Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap()
    );
    assert_eq!(usage[0].visit_count, 2);
    assert_eq!(
        usage[1].time_slot,
        Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
    );
    assert_eq!(usage[1].visit_count, 1);
    // The latest qualifying visit supplies the segment's representative page
    assert_eq!(usage[0].url_id, www.id);
    assert_eq!(usage[1].url_id, www.id);
}

#[test]
fn test_keyword_generated_visits_stay_hidden() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(AddPageArgs::new(
        "https://search.test/?q=weather",
        at(9, 0),
        PageTransition::new(CoreTransition::KeywordGenerated),
    ));

    let row = backend
        .query_url("https://search.test/?q=weather", false)
        .unwrap()
        .row;
    assert!(row.hidden);

    // Hidden pages never surface in browse results
    let results = backend.query_history(None, &QueryOptions::default());
    assert!(results.results.is_empty());
}

#[test]
fn test_visit_duration_update() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(link("https://slow.test/", at(9, 0)));
    let visit_id = backend.query_url("https://slow.test/", true).unwrap().visits[0].id;

    backend.update_visit_duration(visit_id, at(9, 2));
    let visit = backend.query_url("https://slow.test/", true).unwrap().visits[0].clone();
    assert_eq!(visit.visit_duration, Duration::minutes(2));

    // An end time before the visit start is ignored
    backend.update_visit_duration(visit_id, at(8, 0));
    let visit = backend.query_url("https://slow.test/", true).unwrap().visits[0].clone();
    assert_eq!(visit.visit_duration, Duration::minutes(2));
}

#[test]
fn test_delete_all_history_keeps_pinned_urls_zeroed() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    backend.add_page(typed("https://pinned.test/", at(9, 0)));
    backend.add_page(link("https://other.test/", at(9, 5)));

    backend.delete_all_history(&["https://pinned.test/".to_string()]);

    let pinned = backend.query_url("https://pinned.test/", true).unwrap();
    assert_eq!(pinned.row.visit_count, 0);
    assert_eq!(pinned.row.typed_count, 0);
    assert!(pinned.visits.is_empty());
    assert!(backend.query_url("https://other.test/", false).is_none());
    assert!(backend.first_recorded_time().is_none());
}

#[test]
fn test_client_redirect_extends_previous_chain() {
    let dir = TempDir::new().unwrap();
    let mut backend = open_backend(&dir);

    // First navigation in a tab
    let mut first = link("https://shop.test/item", at(9, 0));
    first.context_id = 1;
    first.nav_entry_id = 10;
    backend.add_page(first);

    // The page then client-redirects, replacing the entry
    let mut second = AddPageArgs::new(
        "https://shop.test/item/v2",
        at(9, 1),
        PageTransition::with(CoreTransition::Link, Qualifiers::CLIENT_REDIRECT),
    );
    second.context_id = 1;
    second.nav_entry_id = 10;
    second.referrer = Some("https://shop.test/item".to_string());
    second.redirects = vec![
        "https://shop.test/item".to_string(),
        "https://shop.test/item/v2".to_string(),
    ];
    second.did_replace_entry = true;
    backend.add_page(second);

    let origin = backend.query_url("https://shop.test/item", true).unwrap();
    let target = backend.query_url("https://shop.test/item/v2", true).unwrap();

    // One visit each: the redirect continued the chain instead of
    // re-recording its source
    assert_eq!(origin.visits.len(), 1);
    assert_eq!(target.visits.len(), 1);
    assert!(!origin.visits[0].transition.has(Qualifiers::CHAIN_END));
    assert!(target.visits[0].transition.has(Qualifiers::CHAIN_END));
    assert_eq!(target.visits[0].referring_visit, origin.visits[0].id);

    // The cached chain for the destination reaches back to the origin
    assert_eq!(
        backend.get_cached_recent_redirects("https://shop.test/item/v2"),
        vec![
            "https://shop.test/item".to_string(),
            "https://shop.test/item/v2".to_string()
        ]
    );
}
