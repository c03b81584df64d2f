//! The batch driver.
//!
//! For each pending day the driver runs a fixed pipeline: fetch the day's
//! snapshots per feed, build a journal per feed, merge the trips, build the
//! two artifacts, upload them, and record the result in the metadata
//! catalog. The backlog runs many days through that pipeline concurrently,
//! bounded by a semaphore, and always drains every submitted day before
//! returning the first error it saw.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::day::Day;
use crate::export::{self, ArtifactKind, ExportError};
use crate::fetch::{FetchError, SnapshotFetcher};
use crate::journal::source::DirectorySource;
use crate::journal::{self, Journal, Trip};
use crate::metadata::{calculate_pending_days, Artifact, ProcessedDay};
use crate::storage::{StorageClient, StorageError};

/// Incremented whenever the pipeline's output format or reconciliation
/// semantics change. Days published under an older version are picked up
/// again by the backlog; days published under a newer version are never
/// overwritten.
pub const SOFTWARE_VERSION: i64 = 4;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    FetchError(#[from] FetchError),
    #[error("storage failed: {0}")]
    StorageError(#[from] StorageError),
    #[error("export failed: {0}")]
    ExportError(#[from] ExportError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("feed {0:?} is not configured")]
    UnknownFeed(String),
    #[error("backlog cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct BacklogOptions {
    /// Process at most this many days, newest first.
    pub limit: Option<usize>,
    /// Log the plan without processing anything.
    pub dry_run: bool,
    /// How many days to process concurrently; clamped to at least 1.
    pub concurrency: usize,
}

/// The assembled pipeline: configuration plus the fetch and storage
/// capabilities it drives.
pub struct Etl {
    config: Config,
    tz: chrono_tz::Tz,
    fetcher: Arc<dyn SnapshotFetcher>,
    storage: Arc<StorageClient>,
}

impl Etl {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn SnapshotFetcher>,
        storage: Arc<StorageClient>,
    ) -> Result<Etl, crate::config::ConfigError> {
        let tz = config.parsed_timezone()?;
        Ok(Etl {
            config,
            tz,
            fetcher,
            storage,
        })
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.tz
    }

    /// Ids of the feeds whose validity window covers `day`, alphabetical.
    pub fn feeds_valid_on(&self, day: Day) -> Vec<String> {
        let mut ids: Vec<String> = self
            .config
            .feeds
            .iter()
            .filter(|feed| {
                feed.first_day <= day && feed.last_day.is_none_or(|last| day <= last)
            })
            .map(|feed| feed.id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The newest day the backlog may process: `cutoff_hours` behind now,
    /// so that a day is only admitted once its padded snapshot window has
    /// fully elapsed.
    pub fn cutoff_day(&self, now: DateTime<Utc>) -> Day {
        Day::containing(now - Duration::hours(self.config.cutoff_hours), self.tz)
    }

    /// Run the full pipeline for one day.
    pub async fn run_day(&self, day: Day, feed_ids: &[String]) -> Result<(), PipelineError> {
        for feed_id in feed_ids {
            if !self.config.feeds.iter().any(|feed| feed.id == *feed_id) {
                return Err(PipelineError::UnknownFeed(feed_id.clone()));
            }
        }

        // Scoped working directory for this day's snapshots; removed on
        // every exit path when the guard drops.
        let working_dir = tempfile::Builder::new()
            .prefix(&format!("tripledger_{day}_"))
            .tempdir()?;
        let start = day.start(self.tz);
        let end = day.end(self.tz);
        let padding = Duration::hours(self.config.fetch_padding_hours);

        info!(%day, "stage 1 (fetch snapshots)");
        for feed_id in feed_ids {
            self.fetcher
                .fetch(
                    day,
                    feed_id,
                    (start - padding, end + padding),
                    &working_dir.path().join(feed_id),
                )
                .await?;
        }

        info!(%day, "stage 2 (build journals)");
        let mut trips: Vec<Trip> = Vec::new();
        for feed_id in feed_ids {
            let feed_dir = working_dir.path().join(feed_id);
            let tz = self.tz;
            let journal: Journal = tokio::task::spawn_blocking(move || {
                let mut source = DirectorySource::new(feed_dir, tz)?;
                Ok::<_, std::io::Error>(journal::build_journal(&mut source, start, end))
            })
            .await??;
            info!(%day, feed_id, trips = journal.trips.len(), "journal built");
            trips.extend(journal.trips);
        }

        info!(%day, "stage 3 (create csv artifact)");
        let file_prefix = format!("{}{}_", self.config.remote_prefix, day);
        let csv_bytes =
            tokio::task::spawn_blocking(move || export::csv_tar_xz(&trips, &file_prefix))
                .await??;

        info!(%day, "stage 4 (create gtfsrt artifact)");
        let snapshot_dir = working_dir.path().to_path_buf();
        let export_feed_ids = feed_ids.to_vec();
        let gtfsrt_bytes = tokio::task::spawn_blocking(move || {
            export::gtfsrt_tar_xz(&snapshot_dir, &export_feed_ids, start, end)
        })
        .await??;

        info!(%day, "stage 5 (upload artifacts)");
        let csv = self.upload(day, ArtifactKind::Csv, &csv_bytes).await?;
        let gtfsrt = self.upload(day, ArtifactKind::Gtfsrt, &gtfsrt_bytes).await?;

        info!(%day, "stage 6 (update metadata)");
        let new_entry = ProcessedDay {
            day,
            feeds: feed_ids.to_vec(),
            created: Utc::now(),
            software_version: SOFTWARE_VERSION,
            csv,
            gtfsrt,
        };
        let updated = self
            .storage
            .update_metadata(move |metadata| {
                if let Some(existing) = metadata
                    .processed_days
                    .iter_mut()
                    .find(|processed| processed.day == day)
                {
                    if existing.software_version > SOFTWARE_VERSION {
                        return false;
                    }
                    *existing = new_entry;
                } else {
                    metadata.processed_days.push(new_entry);
                }
                true
            })
            .await?;
        if !updated {
            info!(%day, "metadata not updated: existing entry was built with newer software");
        }
        Ok(())
    }

    /// Process every pending day, newest first.
    ///
    /// Days run concurrently up to `opts.concurrency`. A failing day does
    /// not stop submission of the remaining days; once everything submitted
    /// has drained, the first observed error (or a cancellation indicator)
    /// is returned.
    pub async fn backlog(
        self: Arc<Self>,
        opts: BacklogOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let cutoff = self.cutoff_day(Utc::now());
        let metadata = self.storage.get_metadata().await?;
        let pending = calculate_pending_days(
            &self.config.feeds,
            &metadata.processed_days,
            cutoff,
            SOFTWARE_VERSION,
        );
        if pending.is_empty() {
            info!("no days in the backlog");
            return Ok(());
        }
        info!(days = pending.len(), %cutoff, "backlog computed");
        if opts.dry_run {
            for pending_day in &pending {
                info!(day = %pending_day.day, feeds = ?pending_day.required_feeds, "would process");
            }
            return Ok(());
        }

        let limit = opts.limit.unwrap_or(pending.len());
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut first_error: Option<PipelineError> = None;
        let mut cancelled = false;

        for pending_day in pending.into_iter().take(limit) {
            if *shutdown.borrow() {
                cancelled = true;
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // The semaphore is never closed.
                    Err(_) => break,
                },
                _ = wait_for_cancel(&mut shutdown) => {
                    cancelled = true;
                    break;
                }
            };

            let etl = Arc::clone(&self);
            let day = pending_day.day;
            let feed_ids = pending_day.required_feeds;
            info!(%day, "processing backlog day");
            tasks.spawn(async move {
                let _permit = permit;
                let result = etl.run_day(day, &feed_ids).await;
                match &result {
                    Ok(()) => info!(%day, "success"),
                    Err(err) => error!(%day, %err, "failed"),
                }
                result
            });
        }

        // Drain every submitted day before reporting anything.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(join_err.into());
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if cancelled => Err(PipelineError::Cancelled),
            None => Ok(()),
        }
    }

    /// Remove days from the metadata catalog. With `dry_run` the plan is
    /// logged and nothing is written.
    pub async fn delete_days(&self, days: &[Day], dry_run: bool) -> Result<(), PipelineError> {
        let targets: HashSet<Day> = days.iter().copied().collect();
        self.storage
            .update_metadata(|metadata| {
                let deleted: Vec<String> = metadata
                    .processed_days
                    .iter()
                    .filter(|processed| targets.contains(&processed.day))
                    .map(|processed| processed.day.to_string())
                    .collect();
                info!(count = deleted.len(), days = ?deleted, "deleting processed days");
                if dry_run {
                    info!("dry run: not committing deletions");
                    return false;
                }
                if deleted.is_empty() {
                    return false;
                }
                metadata
                    .processed_days
                    .retain(|processed| !targets.contains(&processed.day));
                true
            })
            .await?;
        Ok(())
    }

    async fn upload(
        &self,
        day: Day,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<Artifact, PipelineError> {
        let checksum = export::checksum(bytes);
        let path = export::artifact_path(day, &self.config.remote_prefix, kind, &checksum);
        self.storage.put_artifact(&path, bytes).await?;
        Ok(Artifact {
            size: bytes.len() as u64,
            path,
            checksum,
        })
    }
}

/// Resolves when the shutdown flag flips to true; pends forever if the
/// sender is gone without cancelling.
pub(crate) async fn wait_for_cancel(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, StorageConfig};
    use crate::fetch::FetchError;
    use crate::storage::MemoryObjectStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn day(s: &str) -> Day {
        s.parse().unwrap()
    }

    fn test_config(feeds: Vec<FeedConfig>) -> Config {
        Config {
            timezone: "America/New_York".to_string(),
            remote_prefix: "subwaydata_".to_string(),
            metadata_path: "metadata.json".to_string(),
            archive_dir: "./unused".to_string(),
            storage: StorageConfig {
                root: "./unused".to_string(),
            },
            fetch_padding_hours: 4,
            cutoff_hours: 29,
            feeds,
        }
    }

    fn ten_day_feed() -> Vec<FeedConfig> {
        vec![FeedConfig {
            id: "feed1".to_string(),
            first_day: day("2021-01-01"),
            last_day: Some(day("2021-01-10")),
        }]
    }

    /// Fetcher that creates an empty snapshot directory, tracks its peak
    /// concurrency, and fails for one configured day.
    #[derive(Default)]
    struct StubFetcher {
        fail_day: Option<Day>,
        calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubFetcher {
        fn failing_on(day: Day) -> StubFetcher {
            StubFetcher {
                fail_day: Some(day),
                ..StubFetcher::default()
            }
        }
    }

    #[async_trait]
    impl SnapshotFetcher for StubFetcher {
        async fn fetch(
            &self,
            day: Day,
            _feed_id: &str,
            _window: (DateTime<Utc>, DateTime<Utc>),
            dest: &Path,
        ) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail_day == Some(day) {
                return Err(FetchError::MissingFeed("injected failure".to_string()));
            }
            tokio::fs::create_dir_all(dest).await?;
            Ok(())
        }
    }

    struct Harness {
        etl: Arc<Etl>,
        fetcher: Arc<StubFetcher>,
        storage: Arc<StorageClient>,
    }

    fn harness(feeds: Vec<FeedConfig>, fetcher: StubFetcher) -> Harness {
        let fetcher = Arc::new(fetcher);
        let storage = Arc::new(StorageClient::new(
            Box::<MemoryObjectStore>::default(),
            "metadata.json",
        ));
        let etl = Arc::new(
            Etl::new(
                test_config(feeds),
                Arc::clone(&fetcher) as Arc<dyn SnapshotFetcher>,
                Arc::clone(&storage),
            )
            .unwrap(),
        );
        Harness {
            etl,
            fetcher,
            storage,
        }
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn backlog_drains_every_submitted_day_and_returns_the_error() {
        let h = harness(ten_day_feed(), StubFetcher::failing_on(day("2021-01-05")));
        let (_tx, rx) = no_shutdown();

        let result = Arc::clone(&h.etl)
            .backlog(
                BacklogOptions {
                    limit: None,
                    dry_run: false,
                    concurrency: 4,
                },
                rx,
            )
            .await;

        assert!(result.is_err());
        // Every day was still submitted and ran to completion.
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 10);
        assert!(h.fetcher.peak.load(Ordering::SeqCst) <= 4);

        let metadata = h.storage.get_metadata().await.unwrap();
        assert_eq!(metadata.processed_days.len(), 9);
        assert!(!metadata
            .processed_days
            .iter()
            .any(|p| p.day == day("2021-01-05")));
        // Committed entries are complete: content-addressed artifacts and
        // the current software version.
        for processed in &metadata.processed_days {
            assert_eq!(processed.software_version, SOFTWARE_VERSION);
            assert_eq!(processed.feeds, vec!["feed1".to_string()]);
            assert_eq!(processed.csv.checksum.len(), 12);
            assert!(processed.csv.path.contains("_csv_"));
            assert!(processed.gtfsrt.path.contains("_gtfsrt_"));
        }
    }

    #[tokio::test]
    async fn backlog_limit_takes_the_newest_days_first() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        let (_tx, rx) = no_shutdown();

        Arc::clone(&h.etl)
            .backlog(
                BacklogOptions {
                    limit: Some(3),
                    dry_run: false,
                    concurrency: 2,
                },
                rx,
            )
            .await
            .unwrap();

        let metadata = h.storage.get_metadata().await.unwrap();
        let days: Vec<String> = metadata
            .processed_days
            .iter()
            .map(|p| p.day.to_string())
            .collect();
        assert_eq!(days, vec!["2021-01-10", "2021-01-09", "2021-01-08"]);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        let (_tx, rx) = no_shutdown();

        Arc::clone(&h.etl)
            .backlog(
                BacklogOptions {
                    limit: None,
                    dry_run: true,
                    concurrency: 4,
                },
                rx,
            )
            .await
            .unwrap();

        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.storage.get_metadata().await.unwrap().processed_days.len(),
            0
        );
    }

    #[tokio::test]
    async fn cancelled_backlog_submits_nothing_and_says_so() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        let (tx, rx) = no_shutdown();
        tx.send(true).unwrap();

        let result = Arc::clone(&h.etl)
            .backlog(BacklogOptions::default(), rx)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_day_rejects_unconfigured_feeds() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        let result = h
            .etl
            .run_day(day("2021-01-05"), &["other_feed".to_string()])
            .await;
        assert!(matches!(result, Err(PipelineError::UnknownFeed(id)) if id == "other_feed"));
    }

    #[tokio::test]
    async fn run_day_overwrites_same_version_entries() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        let target = day("2021-01-05");
        let feeds = vec!["feed1".to_string()];

        h.etl.run_day(target, &feeds).await.unwrap();
        let first = h.storage.get_metadata().await.unwrap().processed_days[0].clone();
        h.etl.run_day(target, &feeds).await.unwrap();
        let metadata = h.storage.get_metadata().await.unwrap();
        assert_eq!(metadata.processed_days.len(), 1);
        // Same inputs, same content-addressed artifacts.
        assert_eq!(metadata.processed_days[0].csv.path, first.csv.path);
    }

    #[tokio::test]
    async fn run_day_declines_to_overwrite_newer_builds() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        let target = day("2021-01-05");
        let newer = ProcessedDay {
            day: target,
            feeds: vec!["feed1".to_string()],
            created: Utc::now(),
            software_version: SOFTWARE_VERSION + 1,
            csv: Artifact {
                size: 1,
                path: "keep_csv".to_string(),
                checksum: "0123456789ab".to_string(),
            },
            gtfsrt: Artifact {
                size: 1,
                path: "keep_gtfsrt".to_string(),
                checksum: "0123456789ab".to_string(),
            },
        };
        h.storage
            .update_metadata(|m| {
                m.processed_days.push(newer);
                true
            })
            .await
            .unwrap();

        // Not an error: the day runs, but the catalog keeps the newer build.
        h.etl
            .run_day(target, &["feed1".to_string()])
            .await
            .unwrap();
        let metadata = h.storage.get_metadata().await.unwrap();
        assert_eq!(metadata.processed_days.len(), 1);
        assert_eq!(metadata.processed_days[0].software_version, SOFTWARE_VERSION + 1);
        assert_eq!(metadata.processed_days[0].csv.path, "keep_csv");
    }

    #[tokio::test]
    async fn delete_days_is_dry_run_unless_confirmed() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        h.etl
            .run_day(day("2021-01-05"), &["feed1".to_string()])
            .await
            .unwrap();
        h.etl
            .run_day(day("2021-01-06"), &["feed1".to_string()])
            .await
            .unwrap();

        h.etl.delete_days(&[day("2021-01-05")], true).await.unwrap();
        assert_eq!(
            h.storage.get_metadata().await.unwrap().processed_days.len(),
            2
        );

        h.etl
            .delete_days(&[day("2021-01-05")], false)
            .await
            .unwrap();
        let metadata = h.storage.get_metadata().await.unwrap();
        assert_eq!(metadata.processed_days.len(), 1);
        assert_eq!(metadata.processed_days[0].day, day("2021-01-06"));
    }

    #[tokio::test]
    async fn feeds_valid_on_respects_the_validity_windows() {
        let h = harness(
            vec![
                FeedConfig {
                    id: "zeta".to_string(),
                    first_day: day("2021-01-01"),
                    last_day: Some(day("2021-01-10")),
                },
                FeedConfig {
                    id: "alpha".to_string(),
                    first_day: day("2021-01-05"),
                    last_day: None,
                },
            ],
            StubFetcher::default(),
        );
        assert_eq!(h.etl.feeds_valid_on(day("2021-01-04")), vec!["zeta"]);
        assert_eq!(
            h.etl.feeds_valid_on(day("2021-01-05")),
            vec!["alpha", "zeta"]
        );
        assert_eq!(h.etl.feeds_valid_on(day("2021-01-11")), vec!["alpha"]);
        assert!(h.etl.feeds_valid_on(day("2020-12-31")).is_empty());
    }

    #[tokio::test]
    async fn cutoff_day_lags_now_by_the_configured_hours() {
        let h = harness(ten_day_feed(), StubFetcher::default());
        // 2022-01-06 12:00 UTC - 29h = 2022-01-05 07:00 UTC = 02:00 New York.
        let now = Utc.with_ymd_and_hms(2022, 1, 6, 12, 0, 0).unwrap();
        assert_eq!(h.etl.cutoff_day(now), day("2022-01-05"));
        // 2022-01-06 04:00 UTC - 29h = 2022-01-04 23:00 UTC = 18:00 Jan 4 NY.
        let now = Utc.with_ymd_and_hms(2022, 1, 6, 4, 0, 0).unwrap();
        assert_eq!(h.etl.cutoff_day(now), day("2022-01-04"));
    }
}
