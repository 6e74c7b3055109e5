mod comic;
mod feed_entry;

#[cfg(test)]
pub use comic::never_read;
pub use comic::{Comic, NewComic, UpdateSchedule};
pub use feed_entry::{FeedEntry, UnreadCount};
