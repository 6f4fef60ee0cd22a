//! SQLite schema definition for the history database.
//!
//! Timestamps are INTEGER microseconds since the Unix epoch. Redirect chains
//! are encoded with the chain-start/chain-end transition bits plus the
//! referring_visit link; there is no separate chain table.

pub const SCHEMA: &str = r#"
-- ============================================
-- URLS & VISITS
-- ============================================

CREATE TABLE IF NOT EXISTS urls (
    id INTEGER PRIMARY KEY,
    url TEXT NOT NULL UNIQUE,              -- Normalized URL string
    title TEXT NOT NULL DEFAULT '',
    visit_count INTEGER NOT NULL DEFAULT 0,
    typed_count INTEGER NOT NULL DEFAULT 0,
    last_visit INTEGER,                    -- Micros since epoch, NULL = never
    hidden INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY,
    url_id INTEGER NOT NULL,
    visit_time INTEGER NOT NULL,
    referring_visit INTEGER NOT NULL DEFAULT 0,   -- 0 = no referrer
    external_referrer_url TEXT NOT NULL DEFAULT '',
    opener_visit INTEGER NOT NULL DEFAULT 0,
    transition INTEGER NOT NULL,                  -- Core type + qualifier bits
    segment_id INTEGER NOT NULL DEFAULT 0,        -- 0 = unassigned
    visit_duration INTEGER NOT NULL DEFAULT 0,    -- Micros
    incremented_omnibox_typed_score INTEGER NOT NULL DEFAULT 0,
    visit_source INTEGER NOT NULL DEFAULT 0,      -- 0 browsed, 1 synced, ...
    originator_cache_guid TEXT NOT NULL DEFAULT '', -- Non-empty = foreign
    originator_visit_id INTEGER NOT NULL DEFAULT 0,
    originator_referring_visit INTEGER NOT NULL DEFAULT 0,
    originator_opener_visit INTEGER NOT NULL DEFAULT 0,
    is_known_to_sync INTEGER NOT NULL DEFAULT 0,
    consider_for_most_visited INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY(url_id) REFERENCES urls(id)
);

CREATE INDEX IF NOT EXISTS visits_url_index ON visits(url_id);
CREATE INDEX IF NOT EXISTS visits_time_index ON visits(visit_time);
CREATE INDEX IF NOT EXISTS visits_originator_index
    ON visits(originator_cache_guid, originator_visit_id);

-- ============================================
-- SEGMENTS (most-visited scoring)
-- ============================================

CREATE TABLE IF NOT EXISTS segments (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,             -- Canonicalized URL key
    url_id INTEGER NOT NULL                -- Representative URL for display
);

CREATE TABLE IF NOT EXISTS segment_usage (
    id INTEGER PRIMARY KEY,
    segment_id INTEGER NOT NULL,
    time_slot INTEGER NOT NULL,            -- Midnight of the day, micros
    visit_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(segment_id, time_slot),
    FOREIGN KEY(segment_id) REFERENCES segments(id) ON DELETE CASCADE
);

-- ============================================
-- ANNOTATIONS
-- ============================================

CREATE TABLE IF NOT EXISTS content_annotations (
    visit_id INTEGER PRIMARY KEY,
    page_language TEXT NOT NULL DEFAULT '',
    password_state INTEGER NOT NULL DEFAULT 0,
    visibility_score REAL NOT NULL DEFAULT -1.0,
    model_version INTEGER NOT NULL DEFAULT -1,
    categories TEXT NOT NULL DEFAULT '[]',         -- JSON [{id, weight}]
    related_searches TEXT NOT NULL DEFAULT '[]',   -- JSON [string]
    alternative_title TEXT NOT NULL DEFAULT '',
    browsing_topics_eligible INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(visit_id) REFERENCES visits(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS context_annotations (
    visit_id INTEGER PRIMARY KEY,
    window_id INTEGER NOT NULL DEFAULT 0,
    tab_id INTEGER NOT NULL DEFAULT 0,
    response_code INTEGER NOT NULL DEFAULT 0,
    omnibox_url_copied INTEGER NOT NULL DEFAULT 0,
    is_existing_bookmark INTEGER NOT NULL DEFAULT 0,
    is_new_bookmark INTEGER NOT NULL DEFAULT 0,
    total_foreground_duration INTEGER NOT NULL DEFAULT 0,  -- Micros
    FOREIGN KEY(visit_id) REFERENCES visits(id) ON DELETE CASCADE
);

-- ============================================
-- CLUSTERS
-- ============================================

CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY,
    keywords TEXT NOT NULL DEFAULT '[]',   -- JSON [string]
    originator_cache_guid TEXT NOT NULL DEFAULT '',
    originator_cluster_id INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cluster_visits (
    cluster_id INTEGER NOT NULL,
    visit_id INTEGER NOT NULL,
    score REAL NOT NULL DEFAULT 0.0,
    interaction_state INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(cluster_id, visit_id),
    FOREIGN KEY(cluster_id) REFERENCES clusters(id) ON DELETE CASCADE
);

-- Visits subsumed by a top-level cluster visit.
CREATE TABLE IF NOT EXISTS cluster_visit_duplicates (
    visit_id INTEGER NOT NULL,             -- The top-level cluster visit
    duplicate_visit_id INTEGER NOT NULL,
    PRIMARY KEY(visit_id, duplicate_visit_id)
);

-- ============================================
-- KEYWORD SEARCH TERMS
-- ============================================

CREATE TABLE IF NOT EXISTS keyword_search_terms (
    keyword_id INTEGER NOT NULL,
    url_id INTEGER NOT NULL,
    term TEXT NOT NULL,
    normalized_term TEXT NOT NULL,
    PRIMARY KEY(keyword_id, url_id)
);

CREATE INDEX IF NOT EXISTS keyword_search_terms_index
    ON keyword_search_terms(keyword_id, normalized_term);

-- ============================================
-- DOWNLOADS
-- ============================================

CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY,
    guid TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL,
    target_path TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    received_bytes INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL DEFAULT 0,
    opened INTEGER NOT NULL DEFAULT 0
);

-- ============================================
-- BACKEND METADATA
-- ============================================

-- Persisted engine flags: foreign-visit sweep watermark, may-contain-foreign
-- bit, known-to-sync bit.
CREATE TABLE IF NOT EXISTS backend_metadata (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;
