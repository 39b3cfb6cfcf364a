//! Ingest run configuration, loaded from TOML. Every field has a default, so
//! an empty file is a valid config; CLI flags override individual fields.
//!
//! ```toml
//! output_dir = "data"
//! verify_checksum = true
//! batch_size = 5000
//! workers = 4
//! destination = "clickhouse"
//!
//! [clickhouse]
//! database = "crypto"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use klinehouse_core::data::fetch::{DEFAULT_BACKOFF_STEP, DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES};
use klinehouse_core::data::RetryPolicy;
use klinehouse_core::store::{
    ClickHouseConfig, ClickHouseStore, Destination, MemoryStore, ParquetStore, StoreError,
    DEFAULT_BATCH_SIZE,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where loaded rows go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    #[default]
    ClickHouse,
    Parquet,
    Memory,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestinationKind::ClickHouse => "clickhouse",
            DestinationKind::Parquet => "parquet",
            DestinationKind::Memory => "memory",
        })
    }
}

impl FromStr for DestinationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clickhouse" | "ch" => Ok(DestinationKind::ClickHouse),
            "parquet" => Ok(DestinationKind::Parquet),
            "memory" => Ok(DestinationKind::Memory),
            other => Err(ConfigError::Invalid(format!(
                "unknown destination '{other}' (expected clickhouse, parquet or memory)"
            ))),
        }
    }
}

/// Values that replace the `CH_*` environment settings when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseOverrides {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl ClickHouseOverrides {
    pub fn apply(&self, mut base: ClickHouseConfig) -> ClickHouseConfig {
        if let Some(url) = &self.url {
            base.url = url.clone();
        }
        if let Some(user) = &self.user {
            base.user = user.clone();
        }
        if let Some(password) = &self.password {
            base.password = password.clone();
        }
        if let Some(database) = &self.database {
            base.database = database.clone();
        }
        base
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Archive cache root; mirrors the remote directory layout.
    pub output_dir: PathBuf,
    pub base_url: String,
    pub verify_checksum: bool,
    pub batch_size: usize,
    /// Targets processed concurrently. 1 means sequential.
    pub workers: usize,
    pub dry_run: bool,
    pub max_retries: u32,
    /// Seconds; the n-th retry waits n times this long.
    pub backoff_secs: u64,
    /// Whole-request timeout for archive downloads, in seconds.
    pub request_timeout_secs: u64,
    pub destination: DestinationKind,
    pub parquet_root: PathBuf,
    /// Where run reports are written; none when unset.
    pub report_dir: Option<PathBuf>,
    pub clickhouse: ClickHouseOverrides,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            base_url: DEFAULT_BASE_URL.to_string(),
            verify_checksum: false,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 1,
            dry_run: false,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_secs: DEFAULT_BACKOFF_STEP.as_secs(),
            request_timeout_secs: 300,
            destination: DestinationKind::default(),
            parquet_root: PathBuf::from("warehouse"),
            report_dir: None,
            clickhouse: ClickHouseOverrides::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_step: Duration::from_secs(self.backoff_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// ClickHouse connection: environment first, then config overrides.
    pub fn clickhouse_config(&self) -> ClickHouseConfig {
        self.clickhouse.apply(ClickHouseConfig::from_env())
    }

    pub fn open_destination(&self) -> Result<Arc<dyn Destination>, StoreError> {
        let destination: Arc<dyn Destination> = match self.destination {
            DestinationKind::ClickHouse => Arc::new(ClickHouseStore::new(self.clickhouse_config())?),
            DestinationKind::Parquet => Arc::new(ParquetStore::new(&self.parquet_root)),
            DestinationKind::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg = IngestConfig::from_toml("").unwrap();
        assert_eq!(cfg, IngestConfig::default());
        assert_eq!(cfg.batch_size, 5000);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.destination, DestinationKind::ClickHouse);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let cfg = IngestConfig::from_toml(
            r#"
            output_dir = "/tmp/archives"
            verify_checksum = true
            workers = 4
            destination = "parquet"

            [clickhouse]
            database = "markets"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/archives"));
        assert!(cfg.verify_checksum);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.destination, DestinationKind::Parquet);
        assert_eq!(cfg.clickhouse.database.as_deref(), Some("markets"));
        assert_eq!(cfg.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            IngestConfig::from_toml("batch_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_destination_is_a_parse_error() {
        assert!(matches!(
            IngestConfig::from_toml(r#"destination = "postgres""#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn toml_roundtrip() {
        let mut cfg = IngestConfig::default();
        cfg.report_dir = Some(PathBuf::from("reports"));
        cfg.clickhouse.user = Some("ingest".into());
        let text = cfg.to_toml().unwrap();
        assert_eq!(IngestConfig::from_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let overrides = ClickHouseOverrides {
            database: Some("markets".into()),
            ..Default::default()
        };
        let cfg = overrides.apply(ClickHouseConfig::default());
        assert_eq!(cfg.database, "markets");
        assert_eq!(cfg.user, "default");
    }

    #[test]
    fn destination_kind_parses_aliases() {
        assert_eq!("CH".parse::<DestinationKind>().unwrap(), DestinationKind::ClickHouse);
        assert_eq!("parquet".parse::<DestinationKind>().unwrap(), DestinationKind::Parquet);
        assert!("sqlite".parse::<DestinationKind>().is_err());
    }

    #[test]
    fn retry_policy_uses_backoff_seconds() {
        let cfg = IngestConfig {
            max_retries: 5,
            backoff_secs: 2,
            ..Default::default()
        };
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
    }
}
