//! Configuration loader and validator for the forwarding core.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

pub const MIN_UPLOAD_THREADS: u32 = 1;
pub const MAX_UPLOAD_THREADS: u32 = 32;
pub const MIN_UPLOAD_LIMIT: u32 = 1;
pub const MAX_UPLOAD_LIMIT: u32 = 8;
pub const MIN_PART_SIZE_KB: u32 = 1;
pub const MAX_PART_SIZE_KB: u32 = 512;

/// Settings keys for DB-stored upload overrides.
pub const SETTING_UPLOAD_THREADS: &str = "upload_threads";
pub const SETTING_UPLOAD_LIMIT: &str = "upload_limit";
pub const SETTING_UPLOAD_PART_SIZE: &str = "upload_part_size_kb";

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub watch: Watch,
    pub retry: Retry,
    pub upload: Upload,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Logical partition of sync state, one per account/context.
    pub namespace: String,
}

/// Watch loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Watch {
    pub message_delay_min_secs: f64,
    pub message_delay_max_secs: f64,
    pub default_interval_minutes: u64,
}

/// Retry budget for per-message forwards and task steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Retry {
    pub max_attempts: u32,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
}

/// Chunked upload tuning. Values are clamped to protocol-safe bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upload {
    pub threads: u32,
    /// Global cap on concurrent upload operations across all tasks.
    pub limit: u32,
    pub part_size_kb: u32,
}

fn clamp(value: u32, min: u32, max: u32) -> u32 {
    value.max(min).min(max)
}

impl Upload {
    pub fn normalized(self) -> Self {
        Self {
            threads: clamp(self.threads, MIN_UPLOAD_THREADS, MAX_UPLOAD_THREADS),
            limit: clamp(self.limit, MIN_UPLOAD_LIMIT, MAX_UPLOAD_LIMIT),
            part_size_kb: clamp(self.part_size_kb, MIN_PART_SIZE_KB, MAX_PART_SIZE_KB),
        }
    }
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            threads: 4,
            limit: 2,
            part_size_kb: 256,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)?;
        fs::create_dir_all(Path::new(&self.app.data_dir).join("temp"))
    }

    pub fn temp_dir(&self) -> std::path::PathBuf {
        Path::new(&self.app.data_dir).join("temp")
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.upload = cfg.upload.normalized();
    validate(&cfg)?;
    Ok(cfg)
}

/// Apply DB-stored upload overrides on top of the file config.
/// Unparsable stored values are ignored.
pub async fn load_upload_overrides(
    pool: &sqlx::SqlitePool,
    base: Upload,
) -> crate::error::Result<Upload> {
    let parse = |v: Option<String>| v.and_then(|s| s.parse::<u32>().ok());

    let threads = parse(crate::db::get_setting(pool, SETTING_UPLOAD_THREADS).await?);
    let limit = parse(crate::db::get_setting(pool, SETTING_UPLOAD_LIMIT).await?);
    let part_size = parse(crate::db::get_setting(pool, SETTING_UPLOAD_PART_SIZE).await?);

    Ok(Upload {
        threads: threads.unwrap_or(base.threads),
        limit: limit.unwrap_or(base.limit),
        part_size_kb: part_size.unwrap_or(base.part_size_kb),
    }
    .normalized())
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.namespace.trim().is_empty() {
        return Err(ConfigError::Invalid("app.namespace must be non-empty"));
    }
    if cfg.watch.default_interval_minutes == 0 {
        return Err(ConfigError::Invalid(
            "watch.default_interval_minutes must be > 0",
        ));
    }
    if cfg.watch.message_delay_min_secs < 0.0
        || cfg.watch.message_delay_max_secs < cfg.watch.message_delay_min_secs
    {
        return Err(ConfigError::Invalid(
            "watch.message_delay window must satisfy 0 <= min <= max",
        ));
    }
    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }
    if cfg.retry.min_delay_secs < 0.0 || cfg.retry.max_delay_secs < cfg.retry.min_delay_secs {
        return Err(ConfigError::Invalid(
            "retry delay window must satisfy 0 <= min <= max",
        ));
    }
    Ok(())
}

/// Returns the reference example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  namespace: "default"

watch:
  message_delay_min_secs: 5.0
  message_delay_max_secs: 10.0
  default_interval_minutes: 30

retry:
  max_attempts: 5
  min_delay_secs: 5.0
  max_delay_secs: 10.0

upload:
  threads: 4
  limit: 2
  part_size_kb: 256
"#
}
