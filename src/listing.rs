//! Key enumeration through the repository REST API.
//!
//! The cache service itself can only resolve a single best match, so
//! listing goes through a separate API with its own token.

use std::{collections::HashMap, env};

use async_trait::async_trait;
use reqwest::{
    header::{ACCEPT, USER_AGENT},
    Client,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    cancel::cancellable,
    config::CacheConfig,
    error::{check_response, CacheError, Result},
};

pub const DEFAULT_API_URL: &str = "https://api.github.com/";
pub const API_URL_ENV: &str = "GITHUB_API_URL";
pub const REPOSITORY_ENV: &str = "GITHUB_REPOSITORY";
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";

const REST_ACCEPT: &str = "application/vnd.github+json";
const PAGE_SIZE: usize = 100;

/// One entry as reported by the listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyInfo {
    pub id: i64,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub key: String,
    pub version: String,
    pub last_accessed_at: String,
    pub created_at: String,
    pub size_in_bytes: u64,
}

#[async_trait]
pub trait KeyLister: Send + Sync {
    /// Every key starting with `prefix`, by key.
    async fn all_keys(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> Result<HashMap<String, CacheKeyInfo>>;
}

#[derive(Debug, Deserialize)]
struct CacheListPage {
    total_count: usize,
    #[serde(default)]
    actions_caches: Vec<CacheKeyInfo>,
}

pub struct RestApi {
    client: Client,
    caches_url: Url,
    token: String,
}

impl RestApi {
    /// `repo` is `owner/name`.
    pub fn new(repo: &str, token: impl Into<String>, config: &CacheConfig) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, repo, token, config)
    }

    pub fn with_base_url(
        base_url: &str,
        repo: &str,
        token: impl Into<String>,
        config: &CacheConfig,
    ) -> Result<Self> {
        if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(CacheError::Config(format!(
                "repository {repo:?} is not in owner/name form"
            )));
        }
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            caches_url: base.join(&format!("repos/{repo}/actions/caches"))?,
            token: token.into(),
        })
    }

    /// Reads `GITHUB_REPOSITORY`, `GITHUB_TOKEN` and optionally
    /// `GITHUB_API_URL`. Returns `None` if either of the first two is unset.
    pub fn from_env(config: &CacheConfig) -> Result<Option<Self>> {
        let (Ok(repo), Ok(token)) = (env::var(REPOSITORY_ENV), env::var(TOKEN_ENV)) else {
            return Ok(None);
        };
        if repo.is_empty() || token.is_empty() {
            return Ok(None);
        }
        let base = env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::with_base_url(&base, &repo, token, config).map(Some)
    }

    async fn fetch_page(&self, prefix: &str, page: usize) -> Result<CacheListPage> {
        debug!(prefix, page, "listing cache keys");
        let response = self
            .client
            .get(self.caches_url.clone())
            .bearer_auth(&self.token)
            .header(ACCEPT, REST_ACCEPT)
            .header(USER_AGENT, concat!("actions-cache/", env!("CARGO_PKG_VERSION")))
            .query(&[
                ("key", prefix.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(CacheError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        check_response(status, &body)?;
        serde_json::from_slice(&body).map_err(|source| CacheError::Decode {
            source,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

#[async_trait]
impl KeyLister for RestApi {
    async fn all_keys(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> Result<HashMap<String, CacheKeyInfo>> {
        let mut keys = HashMap::new();
        let mut seen = 0usize;
        let mut page = 1usize;
        loop {
            let listed = cancellable(ctx, self.fetch_page(prefix, page)).await?;
            if listed.actions_caches.is_empty() {
                break;
            }
            seen += listed.actions_caches.len();
            for info in listed.actions_caches {
                keys.insert(info.key.clone(), info);
            }
            if seen >= listed.total_count {
                break;
            }
            page += 1;
        }
        debug!(prefix, count = keys.len(), "listed cache keys");
        Ok(keys)
    }
}
