use std::sync::Arc;

use crate::db::Repository;
use crate::error::Result;
use crate::models::{Comic, FeedEntry};

use super::fetcher::FeedFetcher;
use super::reconcile::{latest, reconcile};

/// What one comic's feed refresh did.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSummary {
    pub comic_id: i64,
    pub title: String,
    pub unread: usize,
    pub new: usize,
    /// Newest item in the fetched feed, if it had any.
    pub latest: Option<FeedEntry>,
}

/// Batch job that brings stored feed entries up to date with each comic's feed.
pub struct FeedRefresher {
    repo: Arc<Repository>,
    fetcher: FeedFetcher,
}

impl FeedRefresher {
    pub fn new(repo: Arc<Repository>, fetcher: FeedFetcher) -> Self {
        Self { repo, fetcher }
    }

    pub async fn refresh_comic(&self, comic: &Comic) -> Result<RefreshSummary> {
        let fresh = self.fetcher.fetch_entries(comic).await?;
        self.apply(comic, fresh).await
    }

    /// Refreshes every comic, skipping the ones whose feed could not be
    /// fetched or saved.
    pub async fn refresh_all(&self, comics: Vec<Comic>) -> Vec<RefreshSummary> {
        let with_feeds: Vec<Comic> = comics.into_iter().filter(|c| c.rss_url.is_some()).collect();
        let fetched = self.fetcher.fetch_all(with_feeds).await;

        let mut summaries = Vec::with_capacity(fetched.len());
        for (comic, fresh) in fetched {
            match self.apply(&comic, fresh).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    tracing::error!(comic_id = comic.id, "Failed to save feed entries for {}: {}", comic.title, e);
                }
            }
        }
        summaries
    }

    /// Reconciles `fresh` against what is stored for `comic` and writes the
    /// new entries.
    pub async fn apply(&self, comic: &Comic, fresh: Vec<FeedEntry>) -> Result<RefreshSummary> {
        let latest = latest(&fresh).cloned();

        let known = self.repo.known_feed_entries(comic.id, comic.user_id).await?;
        tracing::debug!(comic_id = comic.id, known = known.len(), fetched = fresh.len(), "Reconciling feed");

        let reconciliation = reconcile(known, fresh);
        tracing::debug!(comic_id = comic.id, candidates = reconciliation.new_count(), "New GUIDs in feed");

        let mut inserted = 0;
        for entry in reconciliation.new_entries.iter().cloned() {
            if self.repo.insert_feed_entry(entry).await? {
                inserted += 1;
            } else {
                tracing::debug!(comic_id = comic.id, "Feed entry was stored concurrently, skipped");
            }
        }

        let summary = RefreshSummary {
            comic_id: comic.id,
            title: comic.title.clone(),
            unread: reconciliation.unread_count(),
            new: inserted,
            latest,
        };
        tracing::info!(
            comic_id = comic.id,
            unread_count = summary.unread,
            new_item_count = summary.new,
            "Saved new feed entries"
        );
        Ok(summary)
    }
}
