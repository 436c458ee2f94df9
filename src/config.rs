use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{ALL_PRODUCTS, DEFAULT_ARCHIVE_URL};
use crate::cache::cache_file_path;
use crate::http::{Backoff, RetryPolicy};
use crate::merge::ValidationPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_archive_url")]
    pub archive_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            parallel_requests: default_parallel_requests(),
            retry_attempts: default_retry_attempts(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            archive_url: default_archive_url(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff: Backoff {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                ..Backoff::default()
            },
        }
    }
}

fn default_parallel_requests() -> usize {
    8
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_archive_url() -> String {
    DEFAULT_ARCHIVE_URL.to_string()
}
fn default_user_agent() -> String {
    format!("buildhub-records/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_products")]
    pub products: Vec<String>,
    #[serde(default)]
    pub validation: ValidationPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            products: default_products(),
            validation: ValidationPolicy::default(),
        }
    }
}

fn default_products() -> Vec<String> {
    ALL_PRODUCTS.iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_folder")]
    pub folder: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            folder: default_cache_folder(),
        }
    }
}

fn default_cache_folder() -> PathBuf {
    PathBuf::from(".")
}

impl CacheConfig {
    pub fn file_path(&self) -> PathBuf {
        cache_file_path(&self.folder)
    }
}

/// Load the config file at `path` (defaults when it does not exist), apply
/// environment overrides, and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

pub fn load_config_with_env<F>(path: &Path, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::debug!("No config file at {}, using defaults", path.display());
        Config::default()
    };

    apply_env_overrides(&mut config, env)?;
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = env("NB_PARALLEL_REQUESTS") {
        config.fetch.parallel_requests = v
            .trim()
            .parse()
            .with_context(|| format!("NB_PARALLEL_REQUESTS is not a number: '{}'", v))?;
    }
    if let Some(v) = env("NB_RETRY_REQUEST") {
        config.fetch.retry_attempts = v
            .trim()
            .parse()
            .with_context(|| format!("NB_RETRY_REQUEST is not a number: '{}'", v))?;
    }
    if let Some(v) = env("TIMEOUT_SECONDS") {
        config.fetch.timeout_secs = v
            .trim()
            .parse()
            .with_context(|| format!("TIMEOUT_SECONDS is not a number: '{}'", v))?;
    }
    if let Some(v) = env("PRODUCTS") {
        config.pipeline.products = v.split_whitespace().map(str::to_string).collect();
    }
    if let Some(v) = env("CACHE_FOLDER") {
        config.cache.folder = PathBuf::from(v);
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.fetch.parallel_requests == 0 {
        anyhow::bail!("fetch.parallel_requests must be >= 1");
    }
    if config.fetch.retry_attempts == 0 {
        anyhow::bail!("fetch.retry_attempts must be >= 1");
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be >= 1");
    }
    if config.fetch.backoff_max_ms < config.fetch.backoff_base_ms {
        anyhow::bail!("fetch.backoff_max_ms must be >= fetch.backoff_base_ms");
    }
    if config.pipeline.products.is_empty() {
        anyhow::bail!("pipeline.products must not be empty");
    }
    for product in &config.pipeline.products {
        if !ALL_PRODUCTS.contains(&product.as_str()) {
            anyhow::bail!(
                "Unknown product: '{}'. Must be one of: {}.",
                product,
                ALL_PRODUCTS.join(", ")
            );
        }
    }
    Ok(())
}
