//! Artifact construction: the CSV pair, the raw-snapshot archive, and the
//! content-addressed paths both are published under.

use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use xz2::write::XzEncoder;

use crate::day::Day;
use crate::fetch::capture_time;
use crate::journal::Trip;

const XZ_COMPRESSION_LEVEL: u32 = 6;

/// Leading entry of the raw-snapshot archive. Named so it sorts before the
/// snapshot files themselves.
const GTFSRT_README_NAME: &str = "gtfsrt_readme.md";
const GTFSRT_README: &str = "\
# Raw GTFS-RT archive

Each file in this archive is one GTFS Realtime protocol buffer message as
captured from the transit agency, named so that lexicographic order is
capture order. Only messages captured during the day named in the archive
file name are included.
";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

/// Which of a day's two artifacts a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Csv,
    Gtfsrt,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Csv => "csv",
            ArtifactKind::Gtfsrt => "gtfsrt",
        }
    }
}

/// First 12 hex characters of the SHA-256 of the artifact bytes. This short
/// hash is embedded in the published path, so it must be reproducible
/// bit-for-bit from the artifact alone.
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = format!("{digest:x}");
    hex.truncate(12);
    hex
}

/// The content-addressed object path for one artifact:
/// `<YYYY-MM>/<prefix><YYYY-MM-DD>_<kind>_<checksum12>.tar.xz`.
pub fn artifact_path(day: Day, prefix: &str, kind: ArtifactKind, checksum: &str) -> String {
    format!(
        "{}/{}{}_{}_{}.tar.xz",
        day.month_string(),
        prefix,
        day,
        kind.as_str(),
        checksum
    )
}

/// Export trips as a tar.xz holding `<prefix>trips.csv` and
/// `<prefix>stop_times.csv`.
///
/// The CSVs carry unix-second timestamps with empty cells for nulls, and
/// `1`/`0`/empty for the direction flag. No file metadata is written, so
/// identical trips always produce identical bytes.
pub fn csv_tar_xz(trips: &[Trip], file_prefix: &str) -> Result<Vec<u8>, ExportError> {
    let (trips_csv, stop_times_csv) = build_csv_pair(trips)?;
    let mut archive = TarXz::new();
    archive.append(&format!("{file_prefix}trips.csv"), &trips_csv, None)?;
    archive.append(
        &format!("{file_prefix}stop_times.csv"),
        &stop_times_csv,
        None,
    )?;
    archive.finish()
}

fn build_csv_pair(trips: &[Trip]) -> Result<(Vec<u8>, Vec<u8>), ExportError> {
    let mut trips_csv = csv::Writer::from_writer(Vec::new());
    trips_csv.write_record([
        "trip_uid",
        "trip_id",
        "route_id",
        "direction_id",
        "start_time",
        "vehicle_id",
        "last_observed",
        "marked_past",
        "num_updates",
        "num_schedule_changes",
        "num_schedule_rewrites",
    ])?;
    let mut stop_times_csv = csv::Writer::from_writer(Vec::new());
    stop_times_csv.write_record([
        "trip_uid",
        "stop_id",
        "track",
        "arrival_time",
        "departure_time",
        "last_observed",
        "marked_past",
    ])?;

    for trip in trips {
        trips_csv.write_record([
            trip.uid.as_str(),
            trip.trip_id.as_str(),
            trip.route_id.as_str(),
            direction_cell(trip.direction_id),
            &trip.start_time.timestamp().to_string(),
            trip.vehicle_id.as_deref().unwrap_or(""),
            &trip.last_observed.timestamp().to_string(),
            &unix_cell(trip.marked_past),
            &trip.num_updates.to_string(),
            &trip.num_schedule_changes.to_string(),
            &trip.num_schedule_rewrites.to_string(),
        ])?;
        for stop_time in &trip.stop_times {
            stop_times_csv.write_record([
                trip.uid.as_str(),
                stop_time.stop_id.as_str(),
                stop_time.track.as_deref().unwrap_or(""),
                &unix_cell(stop_time.arrival_time),
                &unix_cell(stop_time.departure_time),
                &stop_time.last_observed.timestamp().to_string(),
                &unix_cell(stop_time.marked_past),
            ])?;
        }
    }

    Ok((into_bytes(trips_csv)?, into_bytes(stop_times_csv)?))
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, ExportError> {
    writer
        .into_inner()
        .map_err(|err| ExportError::IoError(err.into_error()))
}

fn unix_cell(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.timestamp().to_string()).unwrap_or_default()
}

fn direction_cell(direction_id: Option<bool>) -> &'static str {
    match direction_id {
        Some(true) => "1",
        Some(false) => "0",
        None => "",
    }
}

/// Pack the raw snapshot files fetched for a day into a tar.xz, leading
/// with a short readme.
///
/// The fetch window is padded beyond the day itself, so only files whose
/// capture time lies in `[start, end]` are included. Files are taken from
/// `<working_dir>/<feed_id>/` in name (= capture) order.
pub fn gtfsrt_tar_xz(
    working_dir: &Path,
    feed_ids: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<u8>, ExportError> {
    let mut archive = TarXz::new();
    archive.append(GTFSRT_README_NAME, GTFSRT_README.as_bytes(), None)?;
    for feed_id in feed_ids {
        let feed_dir = working_dir.join(feed_id);
        let mut names: Vec<String> = std::fs::read_dir(&feed_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort_unstable();
        for name in names {
            let path = feed_dir.join(&name);
            let Some(captured_at) = capture_time(&path, &name) else {
                continue;
            };
            if captured_at < start || end < captured_at {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            archive.append(&name, &bytes, Some(captured_at))?;
        }
    }
    archive.finish()
}

struct TarXz(tar::Builder<XzEncoder<Vec<u8>>>);

impl TarXz {
    fn new() -> TarXz {
        TarXz(tar::Builder::new(XzEncoder::new(
            Vec::new(),
            XZ_COMPRESSION_LEVEL,
        )))
    }

    fn append(
        &mut self,
        name: &str,
        bytes: &[u8],
        mtime: Option<DateTime<Utc>>,
    ) -> Result<(), ExportError> {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o600);
        if let Some(mtime) = mtime {
            header.set_mtime(mtime.timestamp() as u64);
        }
        header.set_cksum();
        self.0.append_data(&mut header, name, bytes)?;
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, ExportError> {
        Ok(self.0.into_inner()?.finish()?)
    }
}
