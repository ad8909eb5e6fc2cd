use std::fmt;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{
    header::{HeaderValue, RANGE},
    Client,
    StatusCode,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::cancellable,
    error::{check_response, CacheError, Result},
};

/// A committed, immutable cache object.
#[derive(Clone, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "cacheKey", default)]
    pub key: String,
    #[serde(default)]
    pub scope: String,
    /// Direct download URL for the object.
    #[serde(rename = "archiveLocation", default)]
    pub archive_location: String,
    #[serde(skip)]
    client: Client,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.scope == other.scope
            && self.archive_location == other.archive_location
    }
}

impl Eq for Entry {}

impl Entry {
    pub(crate) fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Streams the whole object into `sink`, returning the number of bytes
    /// written.
    pub async fn download<W>(&self, ctx: &CancellationToken, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        cancellable(ctx, async {
            let response = self.client.get(&self.archive_location).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(http_error(status, response).await);
            }
            let mut written = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                sink.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            sink.flush().await?;
            Ok(written)
        })
        .await
    }

    /// Buffers the whole object in memory.
    pub async fn read_to_bytes(&self, ctx: &CancellationToken) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.download(ctx, &mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns fewer bytes when the object ends inside the requested range
    /// and `0` when `offset` is at or past the end.
    pub async fn read_at(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = self.read_range(ctx, offset, buf.len() as u64).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Fetches up to `len` bytes starting at `offset` with an HTTP range
    /// request.
    pub async fn read_range(&self, ctx: &CancellationToken, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        // No object extends past u64::MAX, so an overflowing range is past
        // the end.
        let Some(last) = offset.checked_add(len - 1) else {
            return Ok(Bytes::new());
        };
        cancellable(ctx, async {
            let range = HeaderValue::from_str(&format!("bytes={offset}-{last}"))
                .map_err(|e| CacheError::InvalidResponse(e.to_string()))?;
            let response = self
                .client
                .get(&self.archive_location)
                .header(RANGE, range)
                .send()
                .await?;
            match response.status() {
                StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
                StatusCode::PARTIAL_CONTENT => {
                    let mut body = response.bytes().await?;
                    body.truncate(len as usize);
                    Ok(body)
                }
                // The server ignored the range header and sent everything.
                status if status.is_success() => {
                    let mut skipped = 0u64;
                    let mut out = BytesMut::new();
                    let mut stream = response.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        let mut chunk = chunk?;
                        if skipped < offset {
                            let skip = (offset - skipped).min(chunk.len() as u64);
                            skipped += skip;
                            chunk = chunk.slice(skip as usize..);
                        }
                        let room = len as usize - out.len();
                        out.extend_from_slice(&chunk[..chunk.len().min(room)]);
                        if out.len() as u64 == len {
                            break;
                        }
                    }
                    Ok(out.freeze())
                }
                status => Err(http_error(status, response).await),
            }
        })
        .await
    }
}

/// Error for a failed download, decoding a structured service error when the
/// body carries one.
async fn http_error(status: StatusCode, response: reqwest::Response) -> CacheError {
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return CacheError::Transport(err),
    };
    match check_response(status, &body) {
        Err(err) => err,
        Ok(()) => CacheError::Http {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        },
    }
}
