use std::{path::Path, time::Duration};

use actions_cache_utils::BackoffConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Environment prefix for configuration overrides, e.g.
/// `ACTIONS_CACHE_CLIENT_UPLOAD_CONCURRENCY=8`.
pub const ENV_PREFIX: &str = "ACTIONS_CACHE_CLIENT_";

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_RESPONSE_BODY: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of chunk uploads in flight for a single save.
    pub upload_concurrency: usize,
    /// Upper bound on the size of one uploaded chunk.
    pub upload_chunk_size: u64,
    /// JSON response bodies are truncated to this many bytes.
    pub max_response_body: usize,
    pub request_timeout_secs: Option<u64>,
    /// Delay between retries of a conflicting mutable save.
    pub conflict_backoff: BackoffConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_response_body: DEFAULT_MAX_RESPONSE_BODY,
            request_timeout_secs: None,
            conflict_backoff: BackoffConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Loads defaults, then the YAML file at `path`, then environment
    /// overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<CacheConfig> {
        let figment = Self::figment().merge(Yaml::file(path.as_ref()));
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Loads defaults and environment overrides only.
    pub fn from_env() -> Result<CacheConfig> {
        Self::extract(Self::figment().merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<CacheConfig> {
        Self::extract(Self::figment().merge(Yaml::string(yaml)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_concurrency == 0 {
            return Err(CacheError::Config(
                "upload_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.upload_chunk_size == 0 {
            return Err(CacheError::Config(
                "upload_chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.max_response_body == 0 {
            return Err(CacheError::Config(
                "max_response_body must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(CacheConfig::default()))
    }

    fn extract(figment: Figment) -> Result<CacheConfig> {
        let config: CacheConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}
