//! Database schema and migrations for tributary.
//!
//! Migrations are applied in order; the `schema_version` table tracks which
//! ones have run. Timestamps are epoch milliseconds stored as BIGINT.

/// Database migrations (SQLite dialect).
#[cfg(all(feature = "sqlite", not(feature = "postgres")))]
pub const MIGRATIONS: &[&str] = &[
    // v1: feeds, canonical URLs, items, subscriptions, deliveries
    r#"
CREATE TABLE feeds (
    id                          INTEGER PRIMARY KEY AUTOINCREMENT,
    url                         TEXT NOT NULL UNIQUE,
    title                       TEXT,
    description                 TEXT,
    next_fetch_at               BIGINT,          -- NULL = due immediately
    last_fetched_at             BIGINT,
    last_fetch_error            TEXT,
    last_items_count            BIGINT NOT NULL DEFAULT 0,
    consecutive_empty_fetches   BIGINT NOT NULL DEFAULT 0,
    avg_items_per_day           DOUBLE PRECISION NOT NULL DEFAULT 0,
    last_manual_refresh_at      BIGINT,
    created_at                  BIGINT NOT NULL,
    updated_at                  BIGINT NOT NULL
);

CREATE INDEX idx_feeds_next_fetch_at ON feeds(next_fetch_at);

CREATE TABLE canonical_urls (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    url         TEXT NOT NULL UNIQUE,
    created_at  BIGINT NOT NULL
);

CREATE TABLE feed_items (
    id                  TEXT PRIMARY KEY,    -- UUIDv7, sorts by discovery
    feed_id             BIGINT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    canonical_url_id    BIGINT NOT NULL REFERENCES canonical_urls(id),
    guid                TEXT NOT NULL,
    title               TEXT NOT NULL,
    summary             TEXT,
    body                TEXT NOT NULL,
    published_at        BIGINT,
    created_at          BIGINT NOT NULL,
    UNIQUE (feed_id, canonical_url_id)
);

CREATE INDEX idx_feed_items_feed_id ON feed_items(feed_id);

CREATE TABLE subscriptions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     BIGINT NOT NULL,
    feed_id     BIGINT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    created_at  BIGINT NOT NULL,
    UNIQUE (user_id, feed_id)
);

CREATE INDEX idx_subscriptions_feed_id ON subscriptions(feed_id);

CREATE TABLE user_feed_items (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         BIGINT NOT NULL,
    feed_item_id    TEXT NOT NULL REFERENCES feed_items(id) ON DELETE CASCADE,
    dismissed       BOOLEAN NOT NULL DEFAULT 0,
    created_at      BIGINT NOT NULL,
    UNIQUE (user_id, feed_item_id)
);

CREATE INDEX idx_user_feed_items_user ON user_feed_items(user_id, dismissed, created_at);
"#,
    // v2: per-feed claim lease
    r#"
ALTER TABLE feeds ADD COLUMN locked_until BIGINT;
"#,
];

/// Database migrations (PostgreSQL dialect).
#[cfg(feature = "postgres")]
pub const MIGRATIONS: &[&str] = &[
    // v1: feeds, canonical URLs, items, subscriptions, deliveries
    r#"
CREATE TABLE feeds (
    id                          BIGSERIAL PRIMARY KEY,
    url                         TEXT NOT NULL UNIQUE,
    title                       TEXT,
    description                 TEXT,
    next_fetch_at               BIGINT,
    last_fetched_at             BIGINT,
    last_fetch_error            TEXT,
    last_items_count            BIGINT NOT NULL DEFAULT 0,
    consecutive_empty_fetches   BIGINT NOT NULL DEFAULT 0,
    avg_items_per_day           DOUBLE PRECISION NOT NULL DEFAULT 0,
    last_manual_refresh_at      BIGINT,
    created_at                  BIGINT NOT NULL,
    updated_at                  BIGINT NOT NULL
);

CREATE INDEX idx_feeds_next_fetch_at ON feeds(next_fetch_at);

CREATE TABLE canonical_urls (
    id          BIGSERIAL PRIMARY KEY,
    url         TEXT NOT NULL UNIQUE,
    created_at  BIGINT NOT NULL
);

CREATE TABLE feed_items (
    id                  TEXT PRIMARY KEY,
    feed_id             BIGINT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    canonical_url_id    BIGINT NOT NULL REFERENCES canonical_urls(id),
    guid                TEXT NOT NULL,
    title               TEXT NOT NULL,
    summary             TEXT,
    body                TEXT NOT NULL,
    published_at        BIGINT,
    created_at          BIGINT NOT NULL,
    UNIQUE (feed_id, canonical_url_id)
);

CREATE INDEX idx_feed_items_feed_id ON feed_items(feed_id);

CREATE TABLE subscriptions (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL,
    feed_id     BIGINT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    created_at  BIGINT NOT NULL,
    UNIQUE (user_id, feed_id)
);

CREATE INDEX idx_subscriptions_feed_id ON subscriptions(feed_id);

CREATE TABLE user_feed_items (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    feed_item_id    TEXT NOT NULL REFERENCES feed_items(id) ON DELETE CASCADE,
    dismissed       BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      BIGINT NOT NULL,
    UNIQUE (user_id, feed_item_id)
);

CREATE INDEX idx_user_feed_items_user ON user_feed_items(user_id, dismissed, created_at);
"#,
    // v2: per-feed claim lease
    r#"
ALTER TABLE feeds ADD COLUMN locked_until BIGINT;
"#,
];
