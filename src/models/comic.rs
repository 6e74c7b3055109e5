use chrono::{DateTime, Duration, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Which days of the week a comic publishes new pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSchedule {
    pub sunday: bool,
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
}

// Sunday-first, matching how schedules are written on the command line.
const DAY_CODES: [(&str, Weekday); 7] = [
    ("Su", Weekday::Sun),
    ("M", Weekday::Mon),
    ("Tu", Weekday::Tue),
    ("W", Weekday::Wed),
    ("Th", Weekday::Thu),
    ("F", Weekday::Fri),
    ("Sa", Weekday::Sat),
];

impl UpdateSchedule {
    #[allow(dead_code)]
    pub fn daily() -> Self {
        Self {
            sunday: true,
            monday: true,
            tuesday: true,
            wednesday: true,
            thursday: true,
            friday: true,
            saturday: true,
        }
    }

    pub fn updates_on(&self, day: Weekday) -> bool {
        match day {
            Weekday::Sun => self.sunday,
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
        }
    }

    pub fn set(&mut self, day: Weekday, updates: bool) {
        let flag = match day {
            Weekday::Sun => &mut self.sunday,
            Weekday::Mon => &mut self.monday,
            Weekday::Tue => &mut self.tuesday,
            Weekday::Wed => &mut self.wednesday,
            Weekday::Thu => &mut self.thursday,
            Weekday::Fri => &mut self.friday,
            Weekday::Sat => &mut self.saturday,
        };
        *flag = updates;
    }

    /// Compact form such as `"SuWF"`.
    pub fn day_codes(&self) -> String {
        DAY_CODES
            .iter()
            .filter(|(_, day)| self.updates_on(*day))
            .map(|(code, _)| *code)
            .collect()
    }

    /// Inverse of [`UpdateSchedule::day_codes`]. Tokens may appear in any order.
    pub fn parse(codes: &str) -> Result<Self> {
        let mut schedule = Self::default();
        let mut rest = codes.trim();

        while !rest.is_empty() {
            // Two-letter codes first so "Su" is never read as an unknown "S".
            let matched = DAY_CODES
                .iter()
                .filter(|(code, _)| code.len() == 2)
                .chain(DAY_CODES.iter().filter(|(code, _)| code.len() == 1))
                .find(|(code, _)| rest.starts_with(code));

            match matched {
                Some((code, day)) => {
                    schedule.set(*day, true);
                    rest = &rest[code.len()..];
                }
                None => {
                    return Err(AppError::validation(format!(
                        "unknown day code in schedule '{}' at '{}'",
                        codes, rest
                    )))
                }
            }
        }

        Ok(schedule)
    }
}

/// A persisted subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comic {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub base_url: String,
    pub first_comic_url: Option<String>,
    pub latest_comic_url: Option<String>,
    pub rss_url: Option<String>,
    #[serde(flatten)]
    pub schedule: UpdateSchedule,
    pub ordinal: i64,
    pub last_read: DateTime<Utc>,
    pub active: bool,
    pub nsfw: bool,
}

impl Comic {
    pub fn days_ago(&self, now: DateTime<Utc>) -> String {
        days_ago(now - self.last_read)
    }

    /// One line for listings: `[   SuMW] (3 days ago) https://...`
    pub fn summary_line(&self, now: DateTime<Utc>) -> String {
        format!(
            "[{:>11}] ({}) {}",
            self.schedule.day_codes(),
            self.days_ago(now),
            self.base_url
        )
    }
}

/// A subscription that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewComic {
    pub user_id: i64,
    pub title: String,
    pub base_url: String,
    pub first_comic_url: Option<String>,
    pub latest_comic_url: Option<String>,
    pub rss_url: Option<String>,
    pub schedule: UpdateSchedule,
    pub ordinal: i64,
    pub last_read: DateTime<Utc>,
    pub active: bool,
    pub nsfw: bool,
}

impl NewComic {
    pub fn new(user_id: i64, title: impl Into<String>, base_url: impl Into<String>, ordinal: i64) -> Self {
        Self {
            user_id,
            title: title.into(),
            base_url: base_url.into(),
            first_comic_url: None,
            latest_comic_url: None,
            rss_url: None,
            schedule: UpdateSchedule::default(),
            ordinal,
            last_read: never_read(),
            active: true,
            nsfw: false,
        }
    }

    /// Checks the fields the store needs before any row is touched.
    /// Uniqueness of the ordinal is the store's concern, not this one.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(AppError::validation("missing required field: title"));
        }
        if self.base_url.trim().is_empty() {
            return Err(AppError::validation("missing required field: base_url"));
        }
        if self.ordinal == 0 {
            return Err(AppError::validation("missing required field: ordinal"));
        }
        if self.ordinal < 0 {
            return Err(AppError::validation(format!(
                "ordinal must be positive, got {}",
                self.ordinal
            )));
        }
        // A collision shift adds one to every ordinal at or above this one.
        if self.ordinal == i64::MAX {
            return Err(AppError::validation("ordinal is too large"));
        }
        url::Url::parse(&self.base_url).map_err(|e| {
            AppError::validation(format!("invalid base_url '{}': {}", self.base_url, e))
        })?;
        Ok(())
    }
}

/// Default `last_read` for a fresh subscription.
pub fn never_read() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn days_ago(elapsed: Duration) -> String {
    let hours = elapsed.num_seconds() as f64 / 3600.0;
    if hours > 24.0 {
        if hours > 48.0 {
            return format!("{} days ago", (hours / 24.0).round() as i64);
        }
        return "yesterday".to_string();
    }
    if hours > 1.0 {
        return format!("{} hours ago", hours.round() as i64);
    }
    if elapsed.num_seconds() < 60 {
        return "just now".to_string();
    }
    format!("{} minutes ago", (elapsed.num_seconds() as f64 / 60.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_codes_round_trip_through_parse() {
        let schedule = UpdateSchedule::parse("SuMTuWThFSa").unwrap();
        assert_eq!(schedule, UpdateSchedule::daily());
        assert_eq!(schedule.day_codes(), "SuMTuWThFSa");

        let mwf = UpdateSchedule::parse("MWF").unwrap();
        assert!(mwf.monday && mwf.wednesday && mwf.friday);
        assert!(!mwf.sunday && !mwf.tuesday && !mwf.saturday);
        assert_eq!(mwf.day_codes(), "MWF");
    }

    #[test]
    fn parse_accepts_any_order_and_rejects_garbage() {
        let schedule = UpdateSchedule::parse("SaSu").unwrap();
        assert_eq!(schedule.day_codes(), "SuSa");
        assert!(UpdateSchedule::parse("").unwrap() == UpdateSchedule::default());
        assert!(matches!(
            UpdateSchedule::parse("MX"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn validate_requires_title_base_url_and_ordinal() {
        let ok = NewComic::new(1, "XKCD", "https://xkcd.com", 1);
        assert!(ok.validate().is_ok());

        let mut missing_title = ok.clone();
        missing_title.title = String::new();
        assert!(matches!(missing_title.validate(), Err(AppError::Validation(_))));

        let mut missing_url = ok.clone();
        missing_url.base_url = "  ".to_string();
        assert!(matches!(missing_url.validate(), Err(AppError::Validation(_))));

        let mut zero_ordinal = ok.clone();
        zero_ordinal.ordinal = 0;
        assert!(matches!(zero_ordinal.validate(), Err(AppError::Validation(_))));

        let mut top_ordinal = ok.clone();
        top_ordinal.ordinal = i64::MAX;
        assert!(matches!(top_ordinal.validate(), Err(AppError::Validation(_))));

        let mut bad_url = ok;
        bad_url.base_url = "not a url".to_string();
        assert!(matches!(bad_url.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn days_ago_buckets() {
        assert_eq!(days_ago(Duration::seconds(30)), "just now");
        assert_eq!(days_ago(Duration::minutes(20)), "20 minutes ago");
        assert_eq!(days_ago(Duration::hours(5)), "5 hours ago");
        assert_eq!(days_ago(Duration::hours(30)), "yesterday");
        assert_eq!(days_ago(Duration::days(4)), "4 days ago");
    }
}
