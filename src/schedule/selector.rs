use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};

use crate::models::Comic;

/// Decides which comics are due on one particular day.
///
/// Built once per request from "now" and the reference time zone; the
/// decision itself is a pure function of the comic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TodaySelector {
    start_of_today: DateTime<Utc>,
    weekday: Weekday,
}

impl TodaySelector {
    pub fn new<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> Self {
        let local = now.with_timezone(tz);
        Self {
            start_of_today: start_of_day(tz, local.date_naive()),
            weekday: local.weekday(),
        }
    }

    pub fn start_of_today(&self) -> DateTime<Utc> {
        self.start_of_today
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    /// Updates today and not read since local midnight.
    pub fn is_due(&self, comic: &Comic) -> bool {
        comic.schedule.updates_on(self.weekday) && comic.last_read < self.start_of_today
    }
}

/// First instant of `date` in `tz`, expressed in UTC.
///
/// Zones that skip midnight on a DST change have no local 00:00 that day;
/// the first existing instant after it is used instead.
fn start_of_day<Tz: TimeZone>(tz: &Tz, date: chrono::NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::default());
    (0..=24)
        .map(|hours| midnight + Duration::hours(hours))
        .find_map(|local| tz.from_local_datetime(&local).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

/// Splits comics into (due, not due), keeping their input order.
pub fn partition<I>(comics: I, selector: &TodaySelector) -> (Vec<Comic>, Vec<Comic>)
where
    I: IntoIterator<Item = Comic>,
{
    comics.into_iter().partition(|c| selector.is_due(c))
}

/// Like [`partition`] but keyed by ordinal, which is how listings are drawn.
///
/// Two comics sharing an ordinal collapse into one slot: the one with the
/// higher id is written last and wins. Ordinals are unique per user in
/// storage, so this only bites when the input mixes users.
pub fn partition_by_ordinal(
    comics: &HashMap<i64, Comic>,
    selector: &TodaySelector,
) -> (BTreeMap<i64, Comic>, BTreeMap<i64, Comic>) {
    let mut by_id: Vec<Comic> = comics.values().cloned().collect();
    by_id.sort_by_key(|c| c.id);

    let (due, not_due) = partition(by_id, selector);
    let by_ordinal =
        |comics: Vec<Comic>| -> BTreeMap<i64, Comic> { comics.into_iter().map(|c| (c.ordinal, c)).collect() };
    (by_ordinal(due), by_ordinal(not_due))
}
