use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One item from a comic's RSS/Atom feed.
///
/// `id` is `None` until the entry has been written to the store, which is
/// how the refresh job tells freshly fetched entries from known ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    #[serde(skip)]
    pub id: Option<i64>,
    pub user_id: i64,
    pub comic_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub is_read: bool,
}

impl FeedEntry {
    #[allow(dead_code)]
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// Per-comic count of entries not yet marked read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadCount {
    pub comic_id: i64,
    pub unread: u64,
}
