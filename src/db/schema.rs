pub const SCHEMA: &str = r#"
-- comics table
CREATE TABLE IF NOT EXISTS comics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    base_url TEXT NOT NULL,
    first_comic_url TEXT,
    latest_comic_url TEXT,
    rss_url TEXT,
    updates_sunday INTEGER NOT NULL DEFAULT 0,
    updates_monday INTEGER NOT NULL DEFAULT 0,
    updates_tuesday INTEGER NOT NULL DEFAULT 0,
    updates_wednesday INTEGER NOT NULL DEFAULT 0,
    updates_thursday INTEGER NOT NULL DEFAULT 0,
    updates_friday INTEGER NOT NULL DEFAULT 0,
    updates_saturday INTEGER NOT NULL DEFAULT 0,
    ordinal INTEGER NOT NULL,
    last_read TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    nsfw INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(user_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_comics_user_ordinal ON comics(user_id, ordinal);

-- feed_entries table
CREATE TABLE IF NOT EXISTS feed_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    comic_id INTEGER NOT NULL REFERENCES comics(id) ON DELETE CASCADE,
    guid TEXT NOT NULL,
    title TEXT NOT NULL,
    link TEXT NOT NULL,
    published_at TEXT,
    fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
    is_read INTEGER NOT NULL DEFAULT 0,
    UNIQUE(user_id, comic_id, guid)
);

CREATE INDEX IF NOT EXISTS idx_feed_entries_comic ON feed_entries(comic_id, user_id);
CREATE INDEX IF NOT EXISTS idx_feed_entries_is_read ON feed_entries(is_read);
"#;
