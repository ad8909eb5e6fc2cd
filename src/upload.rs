//! Parallel chunk upload for a single reservation.
//!
//! Workers share one [`UploadCursor`] and claim the next contiguous range
//! whenever they become free, so the worker count bounds requests in flight
//! but not how the payload is divided.

use std::{
    ops::Range,
    sync::{Mutex, PoisonError},
};

use actions_cache_blob::Blob;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cancel::cancellable,
    error::{CacheError, Result},
    transport::Transport,
};

/// Next unclaimed offset of a payload, bounded by its size.
#[derive(Debug)]
pub struct UploadCursor {
    next: Mutex<u64>,
    size: u64,
    chunk_size: u64,
}

impl UploadCursor {
    pub fn new(size: u64, chunk_size: u64) -> Self {
        Self {
            next: Mutex::new(0),
            size,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Claims the next range, or `None` once the payload is exhausted.
    pub fn claim(&self) -> Option<Range<u64>> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *next;
        if start >= self.size {
            return None;
        }
        let end = start.saturating_add(self.chunk_size).min(self.size);
        *next = end;
        Some(start..end)
    }
}

/// Uploads every byte of `blob` to reservation `cache_id` using
/// `concurrency` workers. Returns the number of bytes uploaded.
///
/// The first failing worker cancels the others; its error is the one
/// returned.
pub(crate) async fn upload_chunks(
    ctx: &CancellationToken,
    transport: &Transport,
    cache_id: i64,
    blob: &dyn Blob,
    chunk_size: u64,
    concurrency: usize,
) -> Result<u64> {
    let cursor = UploadCursor::new(blob.size(), chunk_size);
    let workers = ctx.child_token();
    let results = join_all(
        (0..concurrency.max(1))
            .map(|worker| upload_worker(&workers, transport, cache_id, blob, &cursor, worker)),
    )
    .await;

    let mut uploaded = 0u64;
    let mut first_error: Option<CacheError> = None;
    for result in results {
        match result {
            Ok(bytes) => uploaded += bytes,
            Err(err) => match &first_error {
                None => first_error = Some(err),
                Some(CacheError::Cancelled) if !err.is_cancelled() => first_error = Some(err),
                Some(_) => {}
            },
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(uploaded)
}

async fn upload_worker(
    workers: &CancellationToken,
    transport: &Transport,
    cache_id: i64,
    blob: &dyn Blob,
    cursor: &UploadCursor,
    worker: usize,
) -> Result<u64> {
    let mut uploaded = 0u64;
    loop {
        if workers.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let Some(range) = cursor.claim() else {
            debug!(worker, uploaded, "upload worker finished");
            return Ok(uploaded);
        };
        let len = range.end - range.start;
        let res = cancellable(workers, async {
            let data = blob
                .read_range(range.clone())
                .await
                .map_err(CacheError::Blob)?;
            if data.len() as u64 != len {
                return Err(CacheError::SizeMismatch {
                    declared: len,
                    uploaded: data.len() as u64,
                });
            }
            transport.upload_chunk(cache_id, range.clone(), data).await
        })
        .await;
        if let Err(err) = res {
            workers.cancel();
            return Err(err);
        }
        uploaded += len;
    }
}
