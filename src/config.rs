use std::path::Path;

use serde::Deserialize;

use crate::day::Day;

/// Top-level configuration for the ETL pipeline, loaded from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IANA timezone the transit system operates in (e.g. "America/New_York").
    /// Civil days, artifact names, and the backlog cutoff are all anchored
    /// to this zone.
    pub timezone: String,
    /// Prefix added to the file name of every published artifact and to the
    /// CSV file names inside the archive.
    #[serde(default)]
    pub remote_prefix: String,
    /// Object-store key of the JSON metadata catalog.
    #[serde(default = "Config::default_metadata_path")]
    pub metadata_path: String,
    /// Local directory holding the raw GTFS-RT snapshot archive, one
    /// subdirectory per feed.
    #[serde(default = "Config::default_archive_dir")]
    pub archive_dir: String,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Hours of padding around a day's local span when fetching snapshots.
    /// Trips that straddle midnight appear in snapshots published outside
    /// the day itself. Defaults to 4.
    #[serde(default = "Config::default_fetch_padding_hours")]
    pub fetch_padding_hours: i64,
    /// How far behind the current instant the backlog cutoff day lies, in
    /// hours. Defaults to 29: a full day plus padding, so a day is only
    /// processed once all of its (padded) snapshots can exist.
    #[serde(default = "Config::default_cutoff_hours")]
    pub cutoff_hours: i64,
    /// The feeds to process and their validity windows.
    pub feeds: Vec<FeedConfig>,
}

/// Where published artifacts and the metadata catalog live.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the object store. The store applies this prefix to
    /// every path it is given.
    #[serde(default = "StorageConfig::default_root")]
    pub root: String,
}

/// A feed's inclusive validity window. An absent `last_day` means the feed
/// is still active.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub first_day: Day,
    #[serde(default)]
    pub last_day: Option<Day>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: Self::default_root(),
        }
    }
}

impl StorageConfig {
    fn default_root() -> String {
        "./data/bucket".to_string()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants that would otherwise surface as confusing
    /// behavior mid-pipeline. Violations are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_timezone()?;
        if self.feeds.is_empty() {
            return Err(ConfigError::Invalid("no feeds configured".to_string()));
        }
        for feed in &self.feeds {
            if feed.id.is_empty() {
                return Err(ConfigError::Invalid("feed with empty id".to_string()));
            }
            if let Some(last_day) = feed.last_day {
                if last_day < feed.first_day {
                    return Err(ConfigError::Invalid(format!(
                        "feed {:?}: last_day {} precedes first_day {}",
                        feed.id, last_day, feed.first_day
                    )));
                }
            }
        }
        if self.fetch_padding_hours < 0 {
            return Err(ConfigError::Invalid(
                "fetch_padding_hours must not be negative".to_string(),
            ));
        }
        if self.cutoff_hours < 24 {
            // A smaller cutoff would admit days whose snapshots are still
            // being captured.
            return Err(ConfigError::Invalid(format!(
                "cutoff_hours must be at least 24, got {}",
                self.cutoff_hours
            )));
        }
        Ok(())
    }

    pub fn parsed_timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            ConfigError::Invalid(format!("invalid IANA timezone {:?}", self.timezone))
        })
    }

    fn default_metadata_path() -> String {
        "metadata.json".to_string()
    }
    fn default_archive_dir() -> String {
        "./data/archive".to_string()
    }
    fn default_fetch_padding_hours() -> i64 {
        4
    }
    fn default_cutoff_hours() -> i64 {
        29
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
