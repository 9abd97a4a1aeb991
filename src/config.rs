//! Import configuration, loadable from TOML.

use crate::{IngestError, IngestResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1_000;
pub const MAX_BATCH_SIZE: usize = 50_000;
/// 1 MiB, matching the upload chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
pub const MIN_CHUNK_SIZE: usize = 1 << 10;

fn default_required_columns() -> Vec<String> {
    vec!["sku".to_string()]
}

/// Knobs for the import pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Rows per store write.
    pub batch_size: usize,
    /// csv reader buffer in bytes; bounds decoder memory.
    pub chunk_size: usize,
    /// Extra attempts for a failed batch write.
    pub max_retries: u32,
    /// First backoff; doubles on each retry.
    pub retry_backoff_ms: u64,
    /// Row errors kept per job (the total is always counted).
    pub max_errors: usize,
    /// Header columns that must exist and be non-empty on every row.
    pub required_columns: Vec<String>,
    /// Capacity of the webhook event queue.
    pub event_queue_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            retry_backoff_ms: 100,
            max_errors: 100,
            required_columns: default_required_columns(),
            event_queue_capacity: 1024,
            logging: LoggingConfig::default(),
        }
    }
}

impl ImportConfig {
    pub fn load(path: &Path) -> IngestResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> IngestResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(IngestError::Config(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(IngestError::Config(format!(
                "chunk_size must be at least {MIN_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        if !self
            .required_columns
            .iter()
            .any(|c| c.trim().eq_ignore_ascii_case("sku"))
        {
            return Err(IngestError::Config(
                "required_columns must include 'sku'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1 << attempt.min(16)))
    }
}

/// Log output format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Log severity level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}
