//! Wire calls against the artifact cache API.
//!
//! Every call reads at most `max_response_body` bytes of the response and
//! checks it for a structured service error before looking at the payload.

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use reqwest::{
    header::{ACCEPT, CONTENT_RANGE, CONTENT_TYPE},
    Client,
    Method,
    RequestBuilder,
    Response,
    StatusCode,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::{
    credentials::Credentials,
    entry::Entry,
    error::{check_response, CacheError, Result},
};

pub const API_ACCEPT: &str = "application/json;api-version=6.0-preview.1";
const API_PATH: &str = "_apis/artifactcache/";
const VERSION_SALT: &str = "|actions-cache-1.0";

/// Fixed version fingerprint sent with every reserve and lookup.
///
/// The service scopes keys by version; nothing stable per invocation is
/// available to hash, so every entry written by this crate shares one salt.
pub fn version_fingerprint() -> String {
    hex::encode(Sha256::digest(VERSION_SALT.as_bytes()))
}

#[derive(Debug, Serialize)]
struct ReserveCacheRequest<'a> {
    key: &'a str,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReserveCacheResponse {
    #[serde(rename = "cacheId", alias = "cacheID", default)]
    cache_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CommitCacheRequest {
    size: u64,
}

pub(crate) struct Transport {
    client: Client,
    api_url: Url,
    token: String,
    max_response_body: usize,
}

impl Transport {
    pub(crate) fn new(client: Client, credentials: &Credentials, max_response_body: usize) -> Result<Self> {
        Ok(Self {
            client,
            api_url: credentials.url().join(API_PATH)?,
            token: credentials.token().to_string(),
            max_response_body,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.api_url.join(path)?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, API_ACCEPT))
    }

    /// Reads the response body, truncated to the configured limit.
    async fn read_body(&self, mut response: Response) -> Result<(StatusCode, Bytes)> {
        let status = response.status();
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            let room = self.max_response_body - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= self.max_response_body {
                break;
            }
        }
        Ok((status, body.freeze()))
    }

    pub(crate) async fn reserve(&self, key: &str, version: &str) -> Result<i64> {
        let request = ReserveCacheRequest { key, version };
        debug!(key, "reserving cache entry");
        let response = self
            .request(Method::POST, "caches")?
            .json(&request)
            .send()
            .await?;
        let (status, body) = self.read_body(response).await?;
        check_response(status, &body)?;
        let reserved: ReserveCacheResponse = decode(&body)?;
        match reserved.cache_id {
            Some(id) if id != 0 => {
                debug!(key, cache_id = id, "reserved cache entry");
                Ok(id)
            }
            _ => Err(CacheError::InvalidResponse(format!(
                "reserve for {key:?} returned no cache id: {}",
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    pub(crate) async fn upload_chunk(&self, cache_id: i64, range: Range<u64>, data: Bytes) -> Result<()> {
        debug!(
            cache_id,
            start = range.start,
            end = range.end,
            "uploading cache chunk"
        );
        let response = self
            .request(Method::PATCH, &format!("caches/{cache_id}"))?
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(
                CONTENT_RANGE,
                format!("bytes {}-{}/*", range.start, range.end - 1),
            )
            .body(data)
            .send()
            .await?;
        let (status, body) = self.read_body(response).await?;
        check_response(status, &body)
    }

    pub(crate) async fn commit(&self, cache_id: i64, size: u64) -> Result<()> {
        debug!(cache_id, size, "committing cache entry");
        let response = self
            .request(Method::POST, &format!("caches/{cache_id}"))?
            .json(&CommitCacheRequest { size })
            .send()
            .await?;
        let (status, body) = self.read_body(response).await?;
        check_response(status, &body)?;
        if !body.is_empty() {
            debug!(cache_id, body = %String::from_utf8_lossy(&body), "commit response");
        }
        Ok(())
    }

    /// Looks up the best match for the ordered candidate prefixes. Ranking is
    /// done by the service.
    pub(crate) async fn lookup(&self, keys: &[&str], version: &str) -> Result<Option<Entry>> {
        let joined = keys.join(",");
        debug!(keys = %joined, "looking up cache entry");
        let response = self
            .request(Method::GET, "cache")?
            .query(&[("keys", joined.as_str()), ("version", version)])
            .send()
            .await?;
        let (status, body) = self.read_body(response).await?;
        check_response(status, &body)?;
        if status == StatusCode::NO_CONTENT || body.is_empty() {
            return Ok(None);
        }
        let entry: Entry = decode(&body)?;
        if entry.key.is_empty() {
            return Ok(None);
        }
        Ok(Some(entry.with_client(self.client.clone())))
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|source| CacheError::Decode {
        source,
        body: String::from_utf8_lossy(body).into_owned(),
    })
}
