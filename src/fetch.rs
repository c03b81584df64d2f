//! Snapshot fetching.
//!
//! The batch driver needs, for a (day, feed) pair, a local directory of raw
//! GTFS-RT files covering the day's padded time window. [`SnapshotFetcher`]
//! is that capability; [`LocalArchiveFetcher`] implements it over a local
//! snapshot archive laid out as `<root>/<feed_id>/<file>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::day::Day;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("feed {0:?} not present in the snapshot archive")]
    MissingFeed(String),
}

/// Capability to materialize a feed's snapshots for a time window into a
/// local directory, named so that lexicographic order is capture order.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(
        &self,
        day: Day,
        feed_id: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
        dest: &Path,
    ) -> Result<(), FetchError>;
}

/// Fetcher over a local snapshot archive.
///
/// Archive files are expected to carry their capture time as a leading run
/// of unix-second digits in the file name (`1631799000.gtfsrt`); files named
/// otherwise fall back to their modification time. Files whose capture time
/// lies within the requested window (inclusive) are copied into the
/// destination directory.
pub struct LocalArchiveFetcher {
    root: PathBuf,
}

impl LocalArchiveFetcher {
    pub fn new(root: impl Into<PathBuf>) -> LocalArchiveFetcher {
        LocalArchiveFetcher { root: root.into() }
    }
}

#[async_trait]
impl SnapshotFetcher for LocalArchiveFetcher {
    async fn fetch(
        &self,
        day: Day,
        feed_id: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
        dest: &Path,
    ) -> Result<(), FetchError> {
        let feed_dir = self.root.join(feed_id);
        if !feed_dir.is_dir() {
            return Err(FetchError::MissingFeed(feed_id.to_string()));
        }
        tokio::fs::create_dir_all(dest).await?;

        let (start, end) = window;
        let mut copied = 0usize;
        let mut entries = tokio::fs::read_dir(&feed_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let path = entry.path();
            let Some(captured_at) = capture_time(&path, &name) else {
                continue;
            };
            if captured_at < start || end < captured_at {
                continue;
            }
            tokio::fs::copy(&path, dest.join(&name)).await?;
            copied += 1;
        }
        debug!(%day, feed_id, copied, "fetched snapshots from local archive");
        Ok(())
    }
}

/// The capture time of an archived snapshot file: a leading run of at least
/// nine unix-second digits in the name, or the file's modification time.
pub fn capture_time(path: &Path, name: &str) -> Option<DateTime<Utc>> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 9 {
        if let Ok(secs) = digits.parse::<i64>() {
            return DateTime::from_timestamp(secs, 0);
        }
    }
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
