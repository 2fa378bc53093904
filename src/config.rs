//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration, assembled from `OPS_ENGINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Directory for daily-rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Whether this instance is a follower. Followers never run scheduler ticks.
    pub follower: bool,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ops-engine.db"),
            log_dir: None,
            follower: false,
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Log directory alone, so logging can be set up before the rest of the
    /// configuration is read and its warnings are not lost.
    pub fn log_dir_from_env() -> Option<PathBuf> {
        std::env::var("OPS_ENGINE_LOG_DIR").ok().map(PathBuf::from)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("OPS_ENGINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: Self::log_dir_from_env(),
            follower: env_parse("OPS_ENGINE_FOLLOWER", defaults.follower),
            executor: ExecutorConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            retention: RetentionConfig::from_env(),
        }
    }
}

/// Task executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrency of the default worker pool used when neither a group nor
    /// a submission names its own pool.
    pub default_pool_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_pool_size: 8,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_pool_size: env_parse("OPS_ENGINE_POOL_SIZE", defaults.default_pool_size)
                .max(1),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Period of the scheduler tick. Also the window used by the cron due-check.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(120), // 2 minutes
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let tick_secs = env_parse(
            "OPS_ENGINE_TICK_SECS",
            defaults.tick_interval.as_secs(),
        );
        Self {
            enabled: env_parse("OPS_ENGINE_SCHEDULER_ENABLED", defaults.enabled),
            tick_interval: Duration::from_secs(tick_secs.max(1)),
        }
    }
}

/// Retention and garbage-collection configuration.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Root directory of the filesystem artifact storage.
    pub storage_root: PathBuf,
    /// Artifacts kept per schedule when the schedule has no override.
    pub default_min_to_retain: u32,
    /// Period of the sweep over artifacts queued for deletion.
    pub gc_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data/artifacts"),
            default_min_to_retain: 5,
            gc_interval: Duration::from_secs(900), // 15 minutes
        }
    }
}

impl RetentionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let gc_secs = env_parse("OPS_ENGINE_GC_SECS", defaults.gc_interval.as_secs());
        Self {
            storage_root: std::env::var("OPS_ENGINE_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            default_min_to_retain: env_parse(
                "OPS_ENGINE_MIN_TO_RETAIN",
                defaults.default_min_to_retain,
            ),
            gc_interval: Duration::from_secs(gc_secs.max(1)),
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or malformed.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).unwrap_or_else(|e| {
            tracing::warn!(?default, "{e}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' ({e})"),
        })
}
