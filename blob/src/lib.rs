//! Payload sources for cache uploads.
//!
//! A [`Blob`] is a byte payload of known length that can be read at
//! arbitrary ranges. Uploads read disjoint ranges concurrently, so
//! implementations must tolerate overlapping calls.

use std::{ops::Range, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;

mod disk;

pub use disk::FileBlob;

#[async_trait]
pub trait Blob: Send + Sync {
    /// Total payload length in bytes.
    fn size(&self) -> u64;

    /// Read exactly `range.end - range.start` bytes starting at `range.start`.
    ///
    /// Returns an error if the range extends past [`Blob::size`].
    async fn read_range(&self, range: Range<u64>) -> Result<Bytes>;
}

#[async_trait]
impl<B: Blob + ?Sized> Blob for Box<B> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        (**self).read_range(range).await
    }
}

#[async_trait]
impl<B: Blob + ?Sized> Blob for Arc<B> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        (**self).read_range(range).await
    }
}

/// In-memory payload.
#[derive(Debug, Clone, Default)]
pub struct BytesBlob {
    data: Bytes,
}

impl BytesBlob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl From<Vec<u8>> for BytesBlob {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for BytesBlob {
    fn from(data: &'static str) -> Self {
        Self::new(data)
    }
}

#[async_trait]
impl Blob for BytesBlob {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        check_range(&range, self.size())?;
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

pub(crate) fn check_range(range: &Range<u64>, size: u64) -> Result<()> {
    if range.start > range.end || range.end > size {
        return Err(anyhow!(
            "range {}..{} is out of bounds for blob of {} bytes",
            range.start,
            range.end,
            size
        ));
    }
    Ok(())
}
