use std::collections::HashMap;

use actions_cache_blob::Blob;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cancel::cancellable,
    config::CacheConfig,
    credentials::{Credentials, Scope},
    entry::Entry,
    error::{CacheError, Result},
    listing::{CacheKeyInfo, KeyLister},
    transport::{version_fingerprint, Transport},
    upload::upload_chunks,
};

/// Longest key the service accepts.
pub const MAX_KEY_LENGTH: usize = 512;

/// An accepted reservation: an exclusive right to upload and commit `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: i64,
    pub key: String,
    pub version: String,
}

/// Client for one cache service endpoint and credential.
pub struct Cache {
    transport: Transport,
    credentials: Credentials,
    config: CacheConfig,
    version: String,
}

impl Cache {
    pub fn new(credentials: Credentials, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let transport = Transport::new(builder.build()?, &credentials, config.max_response_body)?;
        Ok(Self {
            transport,
            credentials,
            config,
            version: version_fingerprint(),
        })
    }

    /// Builds a cache from the runner environment, or `None` when the job has
    /// no cache access.
    pub fn from_env(config: CacheConfig) -> Result<Option<Self>> {
        match Credentials::from_env()? {
            Some(credentials) => Self::new(credentials, config).map(Some),
            None => Ok(None),
        }
    }

    pub fn scopes(&self) -> &[Scope] {
        self.credentials.scopes()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Reserves `key` without uploading anything.
    ///
    /// A reservation that is never committed blocks the key for as long as
    /// the service keeps it.
    pub async fn reserve(&self, ctx: &CancellationToken, key: &str) -> Result<Reservation> {
        validate_key(key)?;
        let id = cancellable(ctx, self.transport.reserve(key, &self.version)).await?;
        Ok(Reservation {
            id,
            key: key.to_string(),
            version: self.version.clone(),
        })
    }

    /// Writes `blob` under `key`: reserve, upload every chunk, commit.
    ///
    /// Fails with a conflict if the key is already reserved or committed.
    /// Nothing is retried.
    #[tracing::instrument(skip(self, ctx, blob), fields(size = blob.size()))]
    pub async fn save(&self, ctx: &CancellationToken, key: &str, blob: &dyn Blob) -> Result<()> {
        let reservation = self.reserve(ctx, key).await?;
        let size = blob.size();
        let uploaded = upload_chunks(
            ctx,
            &self.transport,
            reservation.id,
            blob,
            self.config.upload_chunk_size,
            self.config.upload_concurrency,
        )
        .await?;
        if uploaded != size {
            return Err(CacheError::SizeMismatch {
                declared: size,
                uploaded,
            });
        }
        cancellable(ctx, self.transport.commit(reservation.id, size)).await?;
        info!(key, cache_id = reservation.id, size, "saved cache entry");
        Ok(())
    }

    /// Resolves the first candidate prefix with a committed entry.
    ///
    /// Candidates are tried in order; within a candidate the service picks
    /// the most recently committed match. Returns `None` when nothing
    /// matches.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn load(&self, ctx: &CancellationToken, keys: &[&str]) -> Result<Option<Entry>> {
        if keys.is_empty() {
            return Err(CacheError::InvalidKey("no candidate keys".to_string()));
        }
        for key in keys {
            validate_key(key)?;
        }
        cancellable(ctx, self.transport.lookup(keys, &self.version)).await
    }

    /// Lists every key starting with `prefix` through a secondary listing
    /// API.
    pub async fn all_keys<L>(
        &self,
        ctx: &CancellationToken,
        lister: &L,
        prefix: &str,
    ) -> Result<HashMap<String, CacheKeyInfo>>
    where
        L: KeyLister + ?Sized,
    {
        lister.all_keys(ctx, prefix).await
    }
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key is empty".to_string()));
    }
    if key.contains(',') {
        return Err(CacheError::InvalidKey(format!("{key:?} contains ','")));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LENGTH}",
            key.len()
        )));
    }
    Ok(())
}
