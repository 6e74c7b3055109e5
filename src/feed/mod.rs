mod fetcher;
mod reconcile;
mod refresher;

pub use fetcher::FeedFetcher;
pub use refresher::{FeedRefresher, RefreshSummary};
