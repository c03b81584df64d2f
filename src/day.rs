//! Civil-day value type.
//!
//! A `Day` identifies one calendar day in the project timezone. All of the
//! pipeline's bookkeeping (pending-day calculation, artifact naming, the
//! metadata catalog) is keyed by `Day`; instants only appear once a day is
//! anchored to a timezone with [`Day::start`] / [`Day::end`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("day {0:?} not in the form YYYY-MM-DD")]
pub struct ParseDayError(String);

/// A civil date (year, month, day-of-month), total-ordered, rendered as
/// `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Day(NaiveDate);

impl Day {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Day> {
        NaiveDate::from_ymd_opt(year, month, day).map(Day)
    }

    /// The instant the day begins in `tz`.
    ///
    /// When local midnight falls into a DST gap the day starts at the first
    /// valid local time after it.
    pub fn start(&self, tz: Tz) -> DateTime<Utc> {
        let mut local = self.0.and_time(NaiveTime::MIN);
        loop {
            match tz.from_local_datetime(&local) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                    return t.with_timezone(&Utc);
                }
                LocalResult::None => local += Duration::hours(1),
            }
        }
    }

    /// The instant the day ends in `tz`: the start of the next day.
    pub fn end(&self, tz: Tz) -> DateTime<Utc> {
        self.next().start(tz)
    }

    pub fn next(&self) -> Day {
        // NaiveDate::MAX is hundreds of millennia away.
        Day(self.0.succ_opt().expect("civil day out of range"))
    }

    /// `YYYY-MM`, used to group artifacts by month.
    pub fn month_string(&self) -> String {
        self.0.format("%Y-%m").to_string()
    }

    /// The civil day `instant` falls on in `tz`.
    pub fn containing(instant: DateTime<Utc>, tz: Tz) -> Day {
        Day(instant.with_timezone(&tz).date_naive())
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for Day {
    type Err = ParseDayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Day)
            .map_err(|_| ParseDayError(s.to_string()))
    }
}

impl Serialize for Day {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Day {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
