//! Snapshot sources.
//!
//! A source yields decoded feed messages in non-decreasing publish order,
//! exactly once. [`DirectorySource`] reads a directory of raw GTFS-RT files
//! whose names sort as capture time; bad files are skipped.

use std::fs;
use std::path::PathBuf;

use chrono_tz::Tz;
use tracing::debug;

use super::snapshot::Snapshot;

/// A finite, non-restartable stream of snapshots.
pub trait SnapshotSource {
    fn next(&mut self) -> Option<Snapshot>;
}

/// Reads raw GTFS-RT files from a directory in lexicographic name order.
///
/// Snapshot archives name files by capture time so that lexicographic order
/// is chronological order. Files that cannot be read or decoded are skipped
/// with a debug log; the journal builder is expected to see only the
/// messages that survived.
pub struct DirectorySource {
    dir: PathBuf,
    // Reversed so that `pop` yields names in ascending order.
    file_names: Vec<String>,
    tz: Tz,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, tz: Tz) -> std::io::Result<DirectorySource> {
        let dir = dir.into();
        let mut file_names: Vec<String> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        file_names.sort_unstable();
        file_names.reverse();
        Ok(DirectorySource {
            dir,
            file_names,
            tz,
        })
    }
}

impl SnapshotSource for DirectorySource {
    fn next(&mut self) -> Option<Snapshot> {
        loop {
            let name = self.file_names.pop()?;
            let path = self.dir.join(&name);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping unreadable snapshot file");
                    continue;
                }
            };
            match Snapshot::decode(&bytes, self.tz) {
                Some(snapshot) => return Some(snapshot),
                None => {
                    debug!(path = %path.display(), "skipping undecodable snapshot file");
                    continue;
                }
            }
        }
    }
}

/// A source over a fixed list of snapshots, for tests.
#[cfg(test)]
pub struct VecSource(std::collections::VecDeque<Snapshot>);

#[cfg(test)]
impl VecSource {
    pub fn new(snapshots: Vec<Snapshot>) -> VecSource {
        VecSource(snapshots.into())
    }
}

#[cfg(test)]
impl SnapshotSource for VecSource {
    fn next(&mut self) -> Option<Snapshot> {
        self.0.pop_front()
    }
}
