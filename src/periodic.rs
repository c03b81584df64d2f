//! Scheduled backlog runs.
//!
//! The `periodic` command takes a list of daily local-time windows. At the
//! start of each window the backlog runs with a wall-time budget equal to
//! the window's length, so a slow backlog never bleeds into the next
//! window.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::day::Day;
use crate::pipeline::{wait_for_cancel, BacklogOptions, Etl};

#[derive(Debug, Error)]
#[error("interval {0:?} not in the form HH:MM:SS-HH:MM:SS")]
pub struct ParseIntervalError(String);

/// A daily local-time window in which the backlog may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Offset of the window start from local midnight.
    pub start: Duration,
    /// Offset of the window end from local midnight; never before `start`.
    pub end: Duration,
}

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIntervalError(s.to_string());
        if s.len() != 17 || s.as_bytes()[8] != b'-' {
            return Err(err());
        }
        let start = parse_offset(&s[..8]).ok_or_else(err)?;
        let end = parse_offset(&s[9..]).ok_or_else(err)?;
        if end < start {
            return Err(err());
        }
        Ok(Interval { start, end })
    }
}

/// Parse `HH:MM:SS` as an offset from midnight. Also used for the
/// backlog's `--timeout` flag.
pub(crate) fn parse_offset(s: &str) -> Option<Duration> {
    let t = NaiveTime::parse_from_str(s, "%H:%M:%S").ok()?;
    Some(t.signed_duration_since(NaiveTime::MIN))
}

/// Run the backlog at the start of each interval, forever (or until
/// shutdown). Each run's timeout is the interval's length.
pub async fn run(etl: Arc<Etl>, intervals: &[Interval], mut shutdown: watch::Receiver<bool>) {
    let mut intervals = intervals.to_vec();
    intervals.sort_by_key(|interval| interval.start);
    if intervals.is_empty() {
        return;
    }
    let tz = etl.timezone();

    loop {
        let now = Utc::now();
        let (fire_at, timeout) = next_fire(now, tz, &intervals);
        let pause = (fire_at - now).to_std().unwrap_or_default();
        info!(pause_secs = pause.as_secs(), "pausing until next interval");
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = wait_for_cancel(&mut shutdown) => return,
        }

        // Trip the backlog's shutdown flag when the window closes or the
        // process is asked to stop, whichever comes first.
        let (window_tx, window_rx) = watch::channel(false);
        let mut outer = shutdown.clone();
        let budget = timeout.to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => {}
                _ = wait_for_cancel(&mut outer) => {}
            }
            let _ = window_tx.send(true);
        });

        info!("running scheduled backlog");
        if let Err(err) = Arc::clone(&etl)
            .backlog(BacklogOptions::default(), window_rx)
            .await
        {
            error!(%err, "scheduled backlog failed");
        }
        if *shutdown.borrow() {
            return;
        }
    }
}

/// The next interval start strictly after `now`, with that interval's
/// length. Intervals must be sorted by start offset.
fn next_fire(now: DateTime<Utc>, tz: Tz, intervals: &[Interval]) -> (DateTime<Utc>, Duration) {
    let today = Day::containing(now, tz);
    for day in [today, today.next()] {
        let midnight = day.start(tz);
        for interval in intervals {
            let fire_at = midnight + interval.start;
            if fire_at > now {
                return (fire_at, interval.end - interval.start);
            }
        }
    }
    // Unreachable for non-empty interval lists: tomorrow's first interval
    // is always in the future.
    let first = &intervals[0];
    (
        today.next().start(tz) + first.start,
        first.end - first.start,
    )
}
