use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::cache::{CacheSettings, ReadStateCache, ReadStats, SubmitOutcome};
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::feed::{FeedFetcher, FeedRefresher, RefreshSummary};
use crate::models::{Comic, NewComic, UnreadCount};
use crate::schedule::TodaySelector;

/// Today's reading list, ordered by ordinal.
#[derive(Debug, Clone, Serialize)]
pub struct DueReport {
    pub today: Vec<Comic>,
    #[serde(rename = "therest")]
    pub the_rest: Vec<Comic>,
}

pub struct App {
    user_id: i64,
    tz: Tz,

    // Services
    pub repository: Arc<Repository>,
    cache: ReadStateCache,
    refresher: FeedRefresher,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let repository = Arc::new(Repository::new(&config.db_path).await?);
        Self::with_repository(config, repository)
    }

    pub fn with_repository(config: &Config, repository: Arc<Repository>) -> Result<Self> {
        let tz = config.tz()?;
        let fetcher = FeedFetcher::new(&config.feeds)?;
        let refresher = FeedRefresher::new(Arc::clone(&repository), fetcher);
        let cache = ReadStateCache::spawn(Arc::clone(&repository), CacheSettings::from_config(config));

        Ok(Self {
            user_id: config.user_id,
            tz,
            repository,
            cache,
            refresher,
        })
    }

    /// Adds a subscription for the configured user. With no ordinal given it
    /// goes to the end of the list.
    pub async fn add_comic(&self, mut comic: NewComic, ordinal: Option<i64>) -> Result<i64> {
        comic.user_id = self.user_id;
        comic.ordinal = match ordinal {
            Some(ordinal) => ordinal,
            None => self.repository.next_ordinal(self.user_id).await?,
        };
        let id = self.repository.insert_comic(comic).await?;
        // New subscriptions should show up in the cached listing.
        self.cache.reload().await?;
        Ok(id)
    }

    /// Active comics in reading order, served from the cache.
    pub async fn list(&self) -> Result<Vec<Comic>> {
        self.cache.refresh().await?;
        let mut comics: Vec<Comic> = self.cache.get().await.into_values().collect();
        comics.sort_by_key(|c| (c.ordinal, c.id));
        Ok(comics)
    }

    pub async fn unread_counts(&self) -> Result<Vec<UnreadCount>> {
        self.repository.unread_counts(self.user_id).await
    }

    pub async fn due_report(&self, now: DateTime<Utc>) -> Result<DueReport> {
        self.cache.refresh().await?;
        let selector = TodaySelector::new(now, &self.tz);
        tracing::debug!(
            weekday = ?selector.weekday(),
            start_of_today = %selector.start_of_today(),
            "Selecting comics due today"
        );
        let (today, the_rest) = self.cache.partition_due(&selector).await;
        Ok(DueReport {
            today: today.into_values().collect(),
            the_rest: the_rest.into_values().collect(),
        })
    }

    /// Records that the user opened `comic_id` and returns the comic so the
    /// caller can send them to it. The write happens in the background; a
    /// failure to queue it is logged and does not stop the caller.
    pub async fn read(&self, comic_id: i64) -> Result<Option<Comic>> {
        self.cache.refresh().await?;

        let comic = match self.cache.comic(comic_id).await {
            Some(comic) => Some(comic),
            None => self.repository.fetch_by_id(comic_id, self.user_id).await?,
        };
        let Some(comic) = comic else {
            return Ok(None);
        };

        match self.cache.submit_read(comic_id).await {
            Ok(SubmitOutcome::Queued) => {}
            Ok(SubmitOutcome::Dropped) => {
                tracing::warn!(comic_id, "Read event dropped, queue full");
            }
            Err(e) => {
                tracing::error!(comic_id, "Failed to queue read event: {}", e);
            }
        }
        Ok(Some(comic))
    }

    pub async fn refresh_feeds(&self, comic_id: Option<i64>) -> Result<Vec<RefreshSummary>> {
        match comic_id {
            Some(id) => {
                let comic = self
                    .repository
                    .fetch_by_id(id, self.user_id)
                    .await?
                    .ok_or_else(|| AppError::validation(format!("no comic with id {}", id)))?;
                Ok(vec![self.refresher.refresh_comic(&comic).await?])
            }
            None => {
                let comics = self.list().await?;
                Ok(self.refresher.refresh_all(comics).await)
            }
        }
    }

    pub async fn mark_all(&self, comic_id: i64, is_read: bool) -> Result<usize> {
        self.repository
            .set_feed_entries_read(comic_id, self.user_id, is_read)
            .await
    }

    /// Drains pending read events. Call before the process exits.
    pub async fn shutdown(&self) -> Result<ReadStats> {
        let stats = self.cache.shutdown().await?;
        if stats.dropped > 0 {
            tracing::warn!(dropped = stats.dropped, "Some read events were not saved");
        }
        Ok(stats)
    }
}
