use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{Comic, FeedEntry, NewComic, UnreadCount, UpdateSchedule};

use super::schema::SCHEMA;

const COMIC_COLUMNS: &str = "id, user_id, title, base_url, first_comic_url, latest_comic_url, rss_url, \
     updates_sunday, updates_monday, updates_tuesday, updates_wednesday, updates_thursday, \
     updates_friday, updates_saturday, ordinal, last_read, active, nsfw";

const FEED_ENTRY_COLUMNS: &str =
    "id, user_id, comic_id, guid, title, link, published_at, is_read";

/// Optional filters for [`Repository::fetch_all`]. `None` means "don't care".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComicFilter {
    pub active: Option<bool>,
    pub nsfw: Option<bool>,
}

impl ComicFilter {
    #[allow(dead_code)]
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active(include_nsfw: bool) -> Self {
        Self {
            active: Some(true),
            nsfw: if include_nsfw { None } else { Some(false) },
        }
    }
}

/// Result of applying a read event to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Applied,
    /// The stored `last_read` is newer than the event; nothing was written.
    Stale,
    /// No comic with that id belongs to the user.
    NotFound,
}

/// Row counts around a collision shift.
///
/// `expected` is the number of rows at or above the inserted ordinal before
/// the shift and `shifted` the number the update reported touching. Both run
/// inside the insert transaction, so a mismatch points at a storage bug
/// rather than a concurrent insert. It is logged, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrdinalShift {
    pub ordinal: i64,
    pub expected: usize,
    pub shifted: usize,
}

impl OrdinalShift {
    pub fn is_consistent(&self) -> bool {
        self.expected == self.shifted
    }
}

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    #[cfg(test)]
    pub async fn execute_batch_for_test(&self, sql: &'static str) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Keeps the database thread busy for `duration`.
    #[cfg(test)]
    pub async fn stall_for_test(&self, duration: std::time::Duration) -> Result<()> {
        self.conn
            .call(move |_conn| {
                std::thread::sleep(duration);
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Comic operations

    /// Stores a new subscription at `comic.ordinal`, moving the user's
    /// comics at or above that ordinal up by one if the slot is taken.
    ///
    /// The collision check, the shift and the insert share one IMMEDIATE
    /// transaction, so concurrent inserts for the same user serialize.
    pub async fn insert_comic(&self, comic: NewComic) -> Result<i64> {
        comic.validate()?;

        let title = comic.title.clone();
        let ordinal = comic.ordinal;

        let (id, shift) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let shift = shift_ordinals_for_insert(&tx, comic.user_id, comic.ordinal)?;

                tx.execute(
                    r#"INSERT INTO comics (
                           user_id, title, base_url, first_comic_url, latest_comic_url, rss_url,
                           updates_sunday, updates_monday, updates_tuesday, updates_wednesday,
                           updates_thursday, updates_friday, updates_saturday,
                           ordinal, last_read, active, nsfw
                       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
                    params![
                        comic.user_id,
                        comic.title,
                        comic.base_url,
                        comic.first_comic_url,
                        comic.latest_comic_url,
                        comic.rss_url,
                        comic.schedule.sunday,
                        comic.schedule.monday,
                        comic.schedule.tuesday,
                        comic.schedule.wednesday,
                        comic.schedule.thursday,
                        comic.schedule.friday,
                        comic.schedule.saturday,
                        comic.ordinal,
                        format_datetime(comic.last_read),
                        comic.active,
                        comic.nsfw,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok((id, shift))
            })
            .await?;

        if let Some(shift) = shift {
            if shift.is_consistent() {
                tracing::debug!(ordinal, shifted = shift.shifted, "Shifted colliding ordinals");
            } else {
                tracing::warn!(
                    ordinal,
                    expected = shift.expected,
                    shifted = shift.shifted,
                    "Ordinal shift count does not match counted collisions"
                );
            }
        }
        tracing::debug!(comic_id = id, %title, ordinal, "Inserted new comic");

        Ok(id)
    }

    /// Absent when the id does not exist or belongs to someone else.
    pub async fn fetch_by_id(&self, id: i64, user_id: i64) -> Result<Option<Comic>> {
        let comic = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM comics WHERE id = ?1 AND user_id = ?2",
                    COMIC_COLUMNS
                );
                let comic = conn
                    .query_row(&sql, params![id, user_id], comic_from_row)
                    .optional()?;
                Ok(comic)
            })
            .await?;
        Ok(comic)
    }

    /// The user's comics ordered by ordinal ascending.
    pub async fn fetch_all(&self, user_id: i64, filter: ComicFilter) -> Result<Vec<Comic>> {
        let comics = self
            .conn
            .call(move |conn| {
                let mut sql = format!("SELECT {} FROM comics WHERE user_id = ?1", COMIC_COLUMNS);
                let mut values = vec![Value::Integer(user_id)];
                if let Some(active) = filter.active {
                    values.push(Value::Integer(active as i64));
                    sql.push_str(&format!(" AND active = ?{}", values.len()));
                }
                if let Some(nsfw) = filter.nsfw {
                    values.push(Value::Integer(nsfw as i64));
                    sql.push_str(&format!(" AND nsfw = ?{}", values.len()));
                }
                sql.push_str(" ORDER BY ordinal ASC, id ASC");

                let mut stmt = conn.prepare(&sql)?;
                let comics = stmt
                    .query_map(params_from_iter(values.iter()), comic_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(comics)
            })
            .await?;
        Ok(comics)
    }

    /// First free ordinal past the end of the user's list.
    pub async fn next_ordinal(&self, user_id: i64) -> Result<i64> {
        let next = self
            .conn
            .call(move |conn| {
                let max: Option<i64> = conn.query_row(
                    "SELECT MAX(ordinal) FROM comics WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )?;
                Ok(max.unwrap_or(0) + 1)
            })
            .await?;
        Ok(next)
    }

    /// Moves `last_read` forward to `read_at` and marks the comic's feed
    /// entries read. A `read_at` older than the stored value is not applied.
    pub async fn record_read(
        &self,
        comic_id: i64,
        user_id: i64,
        read_at: DateTime<Utc>,
    ) -> Result<ReadOutcome> {
        let read_at_text = format_datetime(read_at);
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE comics SET last_read = ?1 WHERE id = ?2 AND user_id = ?3 AND last_read <= ?1",
                    params![read_at_text, comic_id, user_id],
                )?;

                let outcome = if updated == 0 {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM comics WHERE id = ?1 AND user_id = ?2)",
                        params![comic_id, user_id],
                        |row| row.get(0),
                    )?;
                    if exists {
                        ReadOutcome::Stale
                    } else {
                        ReadOutcome::NotFound
                    }
                } else {
                    tx.execute(
                        "UPDATE feed_entries SET is_read = 1 WHERE comic_id = ?1 AND user_id = ?2",
                        params![comic_id, user_id],
                    )?;
                    ReadOutcome::Applied
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        if outcome == ReadOutcome::Stale {
            tracing::debug!(comic_id, user_id, %read_at, "Ignored read event older than stored last_read");
        }
        Ok(outcome)
    }

    // Feed entry operations

    pub async fn known_feed_entries(&self, comic_id: i64, user_id: i64) -> Result<Vec<FeedEntry>> {
        let entries = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM feed_entries WHERE comic_id = ?1 AND user_id = ?2 ORDER BY id",
                    FEED_ENTRY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let entries = stmt
                    .query_map(params![comic_id, user_id], feed_entry_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    /// Writes an entry once. Returns `false` when the GUID is already known
    /// for this user and comic, in which case nothing changes.
    pub async fn insert_feed_entry(&self, entry: FeedEntry) -> Result<bool> {
        let inserted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    r#"INSERT INTO feed_entries (user_id, comic_id, guid, title, link, published_at, is_read)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                       ON CONFLICT(user_id, comic_id, guid) DO NOTHING"#,
                    params![
                        entry.user_id,
                        entry.comic_id,
                        entry.guid,
                        entry.title,
                        entry.link,
                        entry.published_at.map(format_datetime),
                        entry.is_read,
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;
        Ok(inserted)
    }

    /// Flags every entry of one comic read or unread. Returns rows touched.
    pub async fn set_feed_entries_read(&self, comic_id: i64, user_id: i64, is_read: bool) -> Result<usize> {
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE feed_entries SET is_read = ?1 WHERE comic_id = ?2 AND user_id = ?3",
                    params![is_read, comic_id, user_id],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed)
    }

    pub async fn unread_counts(&self, user_id: i64) -> Result<Vec<UnreadCount>> {
        let counts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT comic_id, COUNT(*) FROM feed_entries
                       WHERE user_id = ?1 AND is_read = 0
                       GROUP BY comic_id ORDER BY comic_id"#,
                )?;
                let counts = stmt
                    .query_map(params![user_id], |row| {
                        Ok(UnreadCount {
                            comic_id: row.get(0)?,
                            unread: row.get::<_, i64>(1)? as u64,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }
}

/// Makes room at `ordinal` for `user_id`. Returns `None` when the slot was free.
///
/// SQLite checks UNIQUE per row during an UPDATE, so a plain `ordinal + 1`
/// can trip over the next row. The rows are parked at negated values first
/// and flipped back afterwards; stored ordinals are always positive.
fn shift_ordinals_for_insert(
    tx: &rusqlite::Transaction<'_>,
    user_id: i64,
    ordinal: i64,
) -> rusqlite::Result<Option<OrdinalShift>> {
    let collisions: i64 = tx.query_row(
        "SELECT COUNT(*) FROM comics WHERE user_id = ?1 AND ordinal = ?2",
        params![user_id, ordinal],
        |row| row.get(0),
    )?;
    if collisions == 0 {
        return Ok(None);
    }

    let top: i64 = tx.query_row(
        "SELECT MAX(ordinal) FROM comics WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    if top == i64::MAX {
        return Err(rusqlite::Error::IntegralValueOutOfRange(0, top));
    }

    let expected: i64 = tx.query_row(
        "SELECT COUNT(*) FROM comics WHERE user_id = ?1 AND ordinal >= ?2",
        params![user_id, ordinal],
        |row| row.get(0),
    )?;
    let shifted = tx.execute(
        "UPDATE comics SET ordinal = -(ordinal + 1) WHERE user_id = ?1 AND ordinal >= ?2",
        params![user_id, ordinal],
    )?;
    tx.execute(
        "UPDATE comics SET ordinal = -ordinal WHERE user_id = ?1 AND ordinal < 0",
        params![user_id],
    )?;

    Ok(Some(OrdinalShift {
        ordinal,
        expected: expected as usize,
        shifted,
    }))
}

/// Fixed-width UTC text so stored timestamps compare correctly as strings.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56.000000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn datetime_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_datetime(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unparseable timestamp '{}'", text).into(),
        )
    })
}

fn comic_from_row(row: &Row) -> rusqlite::Result<Comic> {
    Ok(Comic {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        base_url: row.get(3)?,
        first_comic_url: row.get(4)?,
        latest_comic_url: row.get(5)?,
        rss_url: row.get(6)?,
        schedule: UpdateSchedule {
            sunday: row.get(7)?,
            monday: row.get(8)?,
            tuesday: row.get(9)?,
            wednesday: row.get(10)?,
            thursday: row.get(11)?,
            friday: row.get(12)?,
            saturday: row.get(13)?,
        },
        ordinal: row.get(14)?,
        last_read: datetime_column(row, 15)?,
        active: row.get(16)?,
        nsfw: row.get(17)?,
    })
}

fn feed_entry_from_row(row: &Row) -> rusqlite::Result<FeedEntry> {
    Ok(FeedEntry {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        comic_id: row.get(2)?,
        guid: row.get(3)?,
        title: row.get(4)?,
        link: row.get(5)?,
        published_at: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| parse_datetime(&s)),
        is_read: row.get(7)?,
    })
}
