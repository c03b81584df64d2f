//! The published-data catalog and the pending-day calculation.
//!
//! The catalog is a JSON document in object storage listing every day that
//! has been processed and published. [`calculate_pending_days`] compares it
//! against the configured feed validity windows to decide which days still
//! need work.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FeedConfig;
use crate::day::Day;

/// The catalog of published days. An absent catalog object is equivalent to
/// an empty one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub processed_days: Vec<ProcessedDay>,
}

/// One published day: which feeds went into it, when and with what software
/// it was built, and the two artifacts it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedDay {
    pub day: Day,
    pub feeds: Vec<String>,
    pub created: DateTime<Utc>,
    pub software_version: i64,
    pub csv: Artifact,
    pub gtfsrt: Artifact,
}

/// An immutable published file at a content-addressed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub size: u64,
    pub path: String,
    pub checksum: String,
}

/// A day whose required feeds are not fully covered by prior output at the
/// current software version.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDay {
    pub day: Day,
    pub required_feeds: Vec<String>,
}

/// Compute the days that must be (re)processed, newest first.
///
/// A day is pending when some feed valid on that day is missing from its
/// processed entry, or the entry was built with older software. Only days up
/// to and including `last_day` are considered.
pub fn calculate_pending_days(
    feeds: &[FeedConfig],
    processed_days: &[ProcessedDay],
    last_day: Day,
    software_version: i64,
) -> Vec<PendingDay> {
    if feeds.is_empty() {
        return Vec::new();
    }
    let upper_bound = last_day.next();

    let mut required: BTreeMap<Day, BTreeSet<&str>> = BTreeMap::new();
    for feed in feeds {
        let feed_upper = match &feed.last_day {
            Some(last) => upper_bound.min(last.next()),
            None => upper_bound,
        };
        let mut day = feed.first_day;
        while day < feed_upper {
            required.entry(day).or_default().insert(feed.id.as_str());
            day = day.next();
        }
    }

    let processed: BTreeMap<Day, &ProcessedDay> =
        processed_days.iter().map(|p| (p.day, p)).collect();

    let mut pending: Vec<PendingDay> = required
        .into_iter()
        .filter(|(day, required_feeds)| match processed.get(day) {
            Some(entry) => {
                entry.software_version < software_version
                    || !required_feeds
                        .iter()
                        .all(|feed| entry.feeds.iter().any(|have| have.as_str() == *feed))
            }
            None => true,
        })
        .map(|(day, required_feeds)| PendingDay {
            day,
            required_feeds: required_feeds.into_iter().map(str::to_string).collect(),
        })
        .collect();

    // BTree iteration already yields ascending days and alphabetical feeds;
    // the contract is descending days, so make both orders explicit.
    for day in &mut pending {
        day.required_feeds.sort_unstable();
    }
    pending.sort_by(|a, b| b.day.cmp(&a.day));
    pending
}
