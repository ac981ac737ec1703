use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::CleanupFrequency;
use crate::locking::{DEFAULT_LOCK_TIMEOUT, LockMode};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "workcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// How workspaces share locks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One lock for the whole cache directory.
    Coarse,
    /// One lock per workspace key.
    #[default]
    FineGrained,
}

/// Fine-tuning of the mark-and-sweep cleanup.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Maximum duration since last use of a workspace before it is marked for removal.
    ///
    /// `null` disables marking, already marked workspaces are still swept.
    #[serde(with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// How often a closing cache runs the cleanup.
    pub frequency: CleanupFrequency,

    /// Minimum time between two access time updates of the same workspace.
    #[serde(with = "humantime_serde")]
    pub touch_every: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention: Some(Duration::from_secs(3600 * 24 * 7)),
            frequency: CleanupFrequency::Daily,
            touch_every: Duration::from_secs(3600),
        }
    }
}

impl CleanupConfig {
    /// Rejects a `retention` shorter than `touch_every`.
    ///
    /// A workspace in use is touched at most once per `touch_every`, so with a shorter
    /// retention it could be marked and swept while still in use.
    fn validate(&self) -> Result<()> {
        if let Some(retention) = self.retention {
            if retention < self.touch_every {
                anyhow::bail!(
                    "cleanup.retention ({}) must not be shorter than cleanup.touch_every ({})",
                    humantime::format_duration(retention),
                    humantime::format_duration(self.touch_every),
                );
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The base directory holding all workspaces. Default is not to cache.
    pub cache_dir: Option<PathBuf>,

    /// How the cache directory is locked against other processes.
    pub lock_mode: LockMode,

    /// How long to wait for a contended lock before failing.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Whether workspaces share one lock or get one each.
    pub granularity: Granularity,

    /// Mark-and-sweep cleanup of unused workspaces.
    pub cleanup: CleanupConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            lock_mode: LockMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            granularity: Granularity::default(),
            cleanup: CleanupConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.cleanup.validate()?;
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
