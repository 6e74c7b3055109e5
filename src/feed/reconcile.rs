//! Merging a freshly fetched feed into the entries already on record.
//!
//! Entries are matched on GUID only. The merge is additive: entries the
//! feed no longer lists (old items trimmed by the publisher) stay on record
//! with their read flag untouched, and fresh copies of known GUIDs are
//! ignored rather than overwriting what was stored.

use std::collections::HashSet;

use crate::models::FeedEntry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Known entries followed by the new ones, in feed order.
    pub merged: Vec<FeedEntry>,
    /// Fresh entries whose GUID was not known yet.
    pub new_entries: Vec<FeedEntry>,
}

impl Reconciliation {
    pub fn unread_count(&self) -> usize {
        self.merged.iter().filter(|e| !e.is_read).count()
    }

    pub fn new_count(&self) -> usize {
        self.new_entries.len()
    }
}

pub fn reconcile(known: Vec<FeedEntry>, fresh: Vec<FeedEntry>) -> Reconciliation {
    let mut seen: HashSet<String> = known.iter().map(|e| e.guid.clone()).collect();
    let mut merged = known;
    let mut new_entries = Vec::new();

    for entry in fresh {
        // `insert` is false for GUIDs already known, including repeats
        // within the same fetch.
        if seen.insert(entry.guid.clone()) {
            merged.push(entry.clone());
            new_entries.push(entry);
        }
    }

    Reconciliation { merged, new_entries }
}

/// The entry with the newest publication time. Entries without one are
/// only picked when nothing else is dated.
pub fn latest(entries: &[FeedEntry]) -> Option<&FeedEntry> {
    entries
        .iter()
        .filter(|e| e.published_at.is_some())
        .max_by_key(|e| e.published_at)
        .or_else(|| entries.first())
}
