use std::time::Duration;

use feed_rs::parser;
use futures::stream::{self, StreamExt};
use reqwest::Client;

use crate::config::FeedConfig;
use crate::error::Result;
use crate::models::{Comic, FeedEntry};

pub struct FeedFetcher {
    client: Client,
    concurrency: usize,
}

impl FeedFetcher {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            concurrency: config.concurrency.max(1),
        })
    }

    /// Current feed items for `comic`. A comic without a feed URL has none.
    pub async fn fetch_entries(&self, comic: &Comic) -> Result<Vec<FeedEntry>> {
        let Some(url) = comic.rss_url.as_deref() else {
            return Ok(Vec::new());
        };

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Failed to fetch feed {}: HTTP {}", url, response.status()).into());
        }

        let bytes = response.bytes().await?;
        parse_entries(comic, &bytes[..])
    }

    /// Fetch several comics' feeds concurrently. Comics whose feed fails to
    /// download or parse are logged and left out.
    pub async fn fetch_all(&self, comics: Vec<Comic>) -> Vec<(Comic, Vec<FeedEntry>)> {
        stream::iter(comics)
            .map(|comic| async move {
                match self.fetch_entries(&comic).await {
                    Ok(entries) => {
                        tracing::debug!("Fetched {} entries for {}", entries.len(), comic.title);
                        Some((comic, entries))
                    }
                    Err(e) => {
                        tracing::warn!(comic_id = comic.id, "Failed to fetch feed for {}: {}", comic.title, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|r| async { r })
            .collect()
            .await
    }
}

/// Turns an RSS/Atom document into unsaved entries owned by `comic`.
pub fn parse_entries(comic: &Comic, body: &[u8]) -> Result<Vec<FeedEntry>> {
    // feed-rs invents ids (link hashes, random UUIDs) for items that have
    // none. Leave them empty so the fallback below stays stable across polls.
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(body)?;

    let entries = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            // Items without a guid are identified by their link.
            let guid = if entry.id.trim().is_empty() {
                link.clone()
            } else {
                entry.id
            };
            if guid.is_empty() {
                tracing::debug!(comic_id = comic.id, "Skipping feed item with neither id nor link");
                return None;
            }

            Some(FeedEntry {
                id: None,
                user_id: comic.user_id,
                comic_id: comic.id,
                guid,
                title: entry
                    .title
                    .map(|t| t.content)
                    .unwrap_or_else(|| "Untitled".to_string()),
                link,
                published_at: entry.published.or(entry.updated),
                is_read: false,
            })
        })
        .collect();

    Ok(entries)
}
