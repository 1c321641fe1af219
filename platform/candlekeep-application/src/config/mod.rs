use candlekeep_domain::services::planner::{DEFAULT_MAX_REQUEST_COUNT, DEFAULT_PAGE_LIMIT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "platform/ops/configs/sample.toml";
pub const DEFAULT_POOL_MAX_SIZE: u32 = 8;
pub const DEFAULT_FEED_BACKOFF_MS: u64 = 500;
pub const DEFAULT_JOB_HISTORY: usize = 1024;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub db: DbConfig,
    pub feed: FeedConfig,
    pub collector: Option<CollectorConfig>,
    pub telemetry: Option<TelemetryConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    pub url: Option<String>,
    pub candles_table: String,
    pub pool_max_size: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    pub market: String,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    pub page_limit: Option<u64>,
    pub max_request_count: Option<u64>,
    pub fill_empty_candles: Option<bool>,
    pub job_history: Option<usize>,
}

/// Log and metrics defaults for the binaries; CLI flags and `CANDLEKEEP_LOG` override them.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `info,candlekeep_domain=debug`.
    pub log_filter: Option<String>,
    pub log_format: Option<LogFormat>,
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unsupported log format: {other} (expected pretty, compact or json)"
            )),
        }
    }
}

impl Config {
    pub fn pool_max_size(&self) -> u32 {
        self.db.pool_max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.feed.backoff_ms.unwrap_or(DEFAULT_FEED_BACKOFF_MS)
    }

    pub fn page_limit(&self) -> u64 {
        self.collector
            .as_ref()
            .and_then(|c| c.page_limit)
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }

    pub fn max_request_count(&self) -> u64 {
        self.collector
            .as_ref()
            .and_then(|c| c.max_request_count)
            .unwrap_or(DEFAULT_MAX_REQUEST_COUNT)
    }

    pub fn fill_empty_candles(&self) -> bool {
        self.collector
            .as_ref()
            .and_then(|c| c.fill_empty_candles)
            .unwrap_or(false)
    }

    pub fn job_history(&self) -> usize {
        self.collector
            .as_ref()
            .and_then(|c| c.job_history)
            .unwrap_or(DEFAULT_JOB_HISTORY)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        self.telemetry.clone().unwrap_or_default()
    }
}

pub fn load_config(path: &Path) -> Result<Config, String> {
    let (config, _source) = load_config_with_source(path)?;
    Ok(config)
}

pub fn load_config_with_source(path: &Path) -> Result<(Config, String), String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {}", path.display(), err))?;
    let config = toml::from_str(&contents)
        .map_err(|err| format!("failed to parse TOML {}: {}", path.display(), err))?;
    Ok((config, contents))
}

pub fn to_toml_pretty(config: &Config) -> Result<String, String> {
    toml::to_string_pretty(config)
        .map_err(|err| format!("failed to serialize config as TOML: {err}"))
}

/// `--config` when given, else `CANDLEKEEP_CONFIG`, else the sample config path.
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    match cli_path {
        Some(path) => path,
        None => match env::var("CANDLEKEEP_CONFIG") {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        },
    }
}

/// `--db-url` when given, else `db.url`, else `CANDLEKEEP_DB_URL`.
pub fn resolve_db_url(cli_url: Option<&str>, config: &Config) -> Result<String, String> {
    pick_db_url(cli_url, config, env::var("CANDLEKEEP_DB_URL").ok())
}

fn pick_db_url(
    cli_url: Option<&str>,
    config: &Config,
    env_url: Option<String>,
) -> Result<String, String> {
    if let Some(url) = cli_url.filter(|url| !url.trim().is_empty()) {
        return Ok(url.to_string());
    }
    match config.db.url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
        _ => env_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                "missing db.url in config and env CANDLEKEEP_DB_URL is not set".to_string()
            }),
    }
}
