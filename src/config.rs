//! Daemon configuration: TOML file plus `DATACHAT_*` environment overrides.
//!
//! Every tunable has a serde default so a missing config file yields a
//! working local setup. Environment overrides win over the file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// HTTP server and storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory holding the daemon database and uploaded dataset files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Worker pool sizing and resource ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker processes kept alive.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Bounded job queue capacity; a full queue blocks submitters.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// RSS ceiling per worker; a worker over this after a job is retired.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Default per-query deadline when the job does not carry its own.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// How many times a job crashed out of a worker is requeued before the
    /// crash is surfaced to the submitter.
    #[serde(default = "default_max_crash_requeues")]
    pub max_crash_requeues: u32,
    /// Grace period for in-flight jobs on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Override for the worker executable; defaults to re-executing the
    /// current binary with the `worker` subcommand.
    #[serde(default)]
    pub worker_path: Option<PathBuf>,
}

/// Rolling-window token rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens allowed per user over the trailing 24 hours.
    #[serde(default = "default_token_limit")]
    pub token_limit: i64,
    /// Usage percent at which completions start carrying a warning.
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,
}

/// LLM provider credentials and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name, `provider/model` or bare (defaults to openai).
    #[serde(default = "default_model")]
    pub model: String,
    pub openai_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub openrouter_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub deepseek_key: Option<String>,
    pub deepseek_base_url: Option<String>,
    /// Maximum tool-call rounds within one turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8741".into()
}

fn default_data_dir() -> PathBuf {
    dirs_fallback().join("datachat")
}

fn dirs_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/share"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_pool_size() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    32
}

fn default_memory_limit_mb() -> u64 {
    1024
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_max_crash_requeues() -> u32 {
    1
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_token_limit() -> i64 {
    5_000_000
}

fn default_warning_percent() -> f64 {
    80.0
}

fn default_model() -> String {
    "openai/gpt-4o".into()
}

fn default_max_tool_rounds() -> usize {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
            memory_limit_mb: default_memory_limit_mb(),
            query_timeout_ms: default_query_timeout_ms(),
            max_crash_requeues: default_max_crash_requeues(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            worker_path: None,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            warning_percent: default_warning_percent(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            openai_key: None,
            openai_base_url: None,
            openrouter_key: None,
            openrouter_base_url: None,
            deepseek_key: None,
            deepseek_base_url: None,
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DATACHAT_BIND_ADDR") {
            self.server.bind_addr = value;
        }
        if let Ok(value) = std::env::var("DATACHAT_DATA_DIR") {
            self.server.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("DATACHAT_POOL_SIZE")
            && let Ok(parsed) = value.parse()
        {
            self.pool.pool_size = parsed;
        }
        if let Ok(value) = std::env::var("DATACHAT_MEMORY_LIMIT_MB")
            && let Ok(parsed) = value.parse()
        {
            self.pool.memory_limit_mb = parsed;
        }
        if let Ok(value) = std::env::var("DATACHAT_QUERY_TIMEOUT_MS")
            && let Ok(parsed) = value.parse()
        {
            self.pool.query_timeout_ms = parsed;
        }
        if let Ok(value) = std::env::var("DATACHAT_TOKEN_LIMIT")
            && let Ok(parsed) = value.parse()
        {
            self.limiter.token_limit = parsed;
        }
        if let Ok(value) = std::env::var("DATACHAT_OPENAI_KEY") {
            self.llm.openai_key = Some(value);
        }
        if let Ok(value) = std::env::var("DATACHAT_MODEL") {
            self.llm.model = value;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.pool_size == 0 {
            return Err(ConfigError::Invalid("pool.pool_size must be >= 1".into()));
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.queue_capacity must be >= 1".into(),
            ));
        }
        if self.limiter.token_limit <= 0 {
            return Err(ConfigError::Invalid(
                "limiter.token_limit must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.limiter.warning_percent) {
            return Err(ConfigError::Invalid(
                "limiter.warning_percent must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.pool_size, 4);
        assert_eq!(config.limiter.token_limit, 5_000_000);
    }

    #[test]
    fn rejects_zero_pool_size() {
        let mut config = Config::default();
        config.pool.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            pool_size = 2
            memory_limit_mb = 256

            [limiter]
            token_limit = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.pool.memory_limit_mb, 256);
        assert_eq!(config.limiter.token_limit, 1000);
        // Unlisted fields fall back to defaults.
        assert_eq!(config.pool.queue_capacity, 32);
        assert_eq!(config.limiter.warning_percent, 80.0);
    }
}
