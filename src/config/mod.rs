//! Engine settings: built-in defaults, then config files, `CONTEXTFIT__*` environment variables and CLI flags.

mod cli;

use std::{
    collections::BTreeMap,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{
    CliArgs, Command, GlobalOverrides, LearnArgs, ObserveArgs, ReinforceArgs, TextArgs,
};

use crate::cache::{CacheConfig, CachePolicy, MAX_TTL_SECONDS};
use crate::domain::{DEFAULT_BATCH_SIZE, FINGERPRINT_BITS, Resolution};
use crate::fingerprint::{DEFAULT_MAX_WORKERS, DEFAULT_RESOLUTIONS, FingerprintOptions};
use crate::infra::db::PostgresSimilarity;
use crate::matching::{DEFAULT_EARLY_TERMINATION, DEFAULT_THRESHOLDS, Thresholds};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "contextfit";
const ENV_PREFIX: &str = "CONTEXTFIT";
const DEFAULT_SQLITE_PATH: &str = "data/contextfit.db";
const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_SAFETY_MARGIN: f64 = 1.2;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub matching: MatchingSettings,
    pub cache: CacheConfig,
    pub learning: LearningSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Postgres,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
    /// Required when `backend` is postgres.
    pub postgres_url: Option<String>,
    pub pool_size: NonZeroU32,
    pub postgres_similarity: PostgresSimilarity,
}

#[derive(Debug, Clone)]
pub struct MatchingSettings {
    /// Ascending and deduplicated; every entry has a threshold.
    pub resolutions: Vec<Resolution>,
    pub thresholds: Thresholds,
    pub early_termination: f64,
    pub adaptive: bool,
    pub max_workers: NonZeroUsize,
}

impl MatchingSettings {
    pub fn fingerprint_options(&self) -> FingerprintOptions {
        FingerprintOptions {
            resolutions: self.resolutions.clone(),
            adaptive: self.adaptive,
            max_workers: self.max_workers.get(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LearningSettings {
    /// Multiplier applied to observed token usage when deriving a working window.
    pub safety_margin: f64,
    pub default_batch_size: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Merge defaults, files, environment and `cli` overrides into validated settings.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("matching.resolutions")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_global_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Parse the process arguments and load settings from them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    storage: RawStorageSettings,
    matching: RawMatchingSettings,
    cache: RawCacheSettings,
    learning: RawLearningSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(backend) = overrides.backend.as_ref() {
            self.storage.backend = Some(backend.clone());
        }
        if let Some(path) = overrides.sqlite_path.as_ref() {
            self.storage.sqlite_path = Some(path.clone());
        }
        if let Some(url) = overrides.postgres_url.as_ref() {
            self.storage.postgres_url = Some(url.clone());
        }
        if let Some(size) = overrides.pool_size {
            self.storage.pool_size = Some(u64::from(size));
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            storage,
            matching,
            cache,
            learning,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let storage = build_storage_settings(storage)?;
        let matching = build_matching_settings(matching)?;
        let cache = build_cache_settings(cache)?;
        let learning = build_learning_settings(learning)?;

        Ok(Self {
            logging,
            storage,
            matching,
            cache,
            learning,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let backend = match storage.backend {
        Some(value) => StorageBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("storage.backend", reason))?,
        None => StorageBackend::Sqlite,
    };

    let postgres_url = storage.postgres_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if backend == StorageBackend::Postgres && postgres_url.is_none() {
        return Err(LoadError::invalid(
            "storage.postgres_url",
            "required when storage.backend is postgres",
        ));
    }

    let sqlite_path = storage
        .sqlite_path
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH));

    let pool_size = non_zero_u32(
        storage.pool_size.unwrap_or(u64::from(DEFAULT_POOL_SIZE)),
        "storage.pool_size",
    )?;

    let postgres_similarity = match storage.postgres_similarity {
        Some(value) => PostgresSimilarity::from_str(&value)
            .map_err(|reason| LoadError::invalid("storage.postgres_similarity", reason))?,
        None => PostgresSimilarity::default(),
    };

    Ok(StorageSettings {
        backend,
        sqlite_path,
        postgres_url,
        pool_size,
        postgres_similarity,
    })
}

fn build_matching_settings(matching: RawMatchingSettings) -> Result<MatchingSettings, LoadError> {
    let mut resolutions = matching
        .resolutions
        .unwrap_or_else(|| DEFAULT_RESOLUTIONS.to_vec());
    resolutions.sort_unstable();
    resolutions.dedup();
    if resolutions.is_empty() {
        return Err(LoadError::invalid(
            "matching.resolutions",
            "at least one resolution is required",
        ));
    }
    if resolutions.contains(&0) {
        return Err(LoadError::invalid(
            "matching.resolutions",
            "resolutions must be greater than zero",
        ));
    }

    let mut thresholds: BTreeMap<Resolution, u32> = DEFAULT_THRESHOLDS.into_iter().collect();
    for (key, value) in matching.thresholds.unwrap_or_default() {
        let resolution = key.trim().parse::<Resolution>().map_err(|err| {
            LoadError::invalid(
                "matching.thresholds",
                format!("`{key}` is not a resolution: {err}"),
            )
        })?;
        if value > FINGERPRINT_BITS {
            return Err(LoadError::invalid(
                "matching.thresholds",
                format!("threshold {value} for resolution {resolution} exceeds {FINGERPRINT_BITS}"),
            ));
        }
        thresholds.insert(resolution, value);
    }
    if let Some(missing) = resolutions
        .iter()
        .find(|resolution| !thresholds.contains_key(resolution))
    {
        return Err(LoadError::invalid(
            "matching.thresholds",
            format!("resolution {missing} has no threshold"),
        ));
    }

    let early_termination = matching
        .early_termination
        .unwrap_or(DEFAULT_EARLY_TERMINATION);
    if !(early_termination > 0.0 && early_termination <= 1.0) {
        return Err(LoadError::invalid(
            "matching.early_termination",
            "must be in (0, 1]",
        ));
    }

    let max_workers = matching.max_workers.unwrap_or(DEFAULT_MAX_WORKERS as u64);
    let max_workers = usize::try_from(max_workers)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| LoadError::invalid("matching.max_workers", "must be greater than zero"))?;

    Ok(MatchingSettings {
        resolutions,
        thresholds: Thresholds::new(thresholds),
        early_termination,
        adaptive: matching.adaptive.unwrap_or(true),
        max_workers,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();
    Ok(CacheConfig {
        tokenizer: cache.tokenizer.resolve(
            defaults.tokenizer,
            "cache.tokenizer.max_size",
            "cache.tokenizer.ttl_seconds",
        )?,
        fingerprint: cache.fingerprint.resolve(
            defaults.fingerprint,
            "cache.fingerprint.max_size",
            "cache.fingerprint.ttl_seconds",
        )?,
        matches: cache.matches.resolve(
            defaults.matches,
            "cache.match.max_size",
            "cache.match.ttl_seconds",
        )?,
        query: cache.query.resolve(
            defaults.query,
            "cache.query.max_size",
            "cache.query.ttl_seconds",
        )?,
        complexity: cache.complexity.resolve(
            defaults.complexity,
            "cache.complexity.max_size",
            "cache.complexity.ttl_seconds",
        )?,
    })
}

fn build_learning_settings(learning: RawLearningSettings) -> Result<LearningSettings, LoadError> {
    let safety_margin = learning.safety_margin.unwrap_or(DEFAULT_SAFETY_MARGIN);
    if !safety_margin.is_finite() || safety_margin < 1.0 {
        return Err(LoadError::invalid(
            "learning.safety_margin",
            "must be a finite value of at least 1.0",
        ));
    }

    let default_batch_size = non_zero_u32(
        learning
            .default_batch_size
            .unwrap_or(u64::from(DEFAULT_BATCH_SIZE)),
        "learning.default_batch_size",
    )?;

    Ok(LearningSettings {
        safety_margin,
        default_batch_size,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    backend: Option<String>,
    sqlite_path: Option<PathBuf>,
    postgres_url: Option<String>,
    pool_size: Option<u64>,
    postgres_similarity: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMatchingSettings {
    resolutions: Option<Vec<Resolution>>,
    /// Keyed by resolution; environment and file keys are strings.
    thresholds: Option<BTreeMap<String, u32>>,
    early_termination: Option<f64>,
    adaptive: Option<bool>,
    max_workers: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    tokenizer: RawCachePolicy,
    fingerprint: RawCachePolicy,
    #[serde(rename = "match")]
    matches: RawCachePolicy,
    query: RawCachePolicy,
    complexity: RawCachePolicy,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCachePolicy {
    max_size: Option<u64>,
    ttl_seconds: Option<u64>,
}

impl RawCachePolicy {
    fn resolve(
        self,
        default: CachePolicy,
        max_size_key: &'static str,
        ttl_key: &'static str,
    ) -> Result<CachePolicy, LoadError> {
        let max_size = match self.max_size {
            Some(value) => usize::try_from(value)
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| LoadError::invalid(max_size_key, "must be greater than zero"))?,
            None => default.max_size,
        };
        let ttl_seconds = self.ttl_seconds.unwrap_or(default.ttl_seconds);
        if ttl_seconds > MAX_TTL_SECONDS {
            return Err(LoadError::invalid(
                ttl_key,
                format!("must be at most {MAX_TTL_SECONDS} seconds"),
            ));
        }
        Ok(CachePolicy::new(max_size, ttl_seconds))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLearningSettings {
    safety_margin: Option<f64>,
    default_batch_size: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
