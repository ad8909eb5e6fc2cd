//! Client for the CI artifact cache service.
//!
//! [`Cache::save`] and [`Cache::load`] expose the service's create-only
//! object store with parallel chunked uploads and prefix lookups.
//! [`Cache::save_mutable`] layers mutable keys on top of it with optimistic
//! versioning.

mod cache;
mod cancel;
mod config;
mod credentials;
mod entry;
mod error;
mod listing;
mod mutable;
mod transport;
mod upload;

#[cfg(test)]
mod testing;

pub use actions_cache_blob::{Blob, BytesBlob, FileBlob};
pub use actions_cache_utils::BackoffConfig;
pub use tokio_util::sync::CancellationToken;

pub use cache::{Cache, Reservation, MAX_KEY_LENGTH};
pub use config::{
    CacheConfig,
    DEFAULT_MAX_RESPONSE_BODY,
    DEFAULT_UPLOAD_CHUNK_SIZE,
    DEFAULT_UPLOAD_CONCURRENCY,
    ENV_PREFIX,
};
pub use credentials::{Credentials, Permission, Scope, CACHE_URL_ENV, RUNTIME_TOKEN_ENV};
pub use entry::Entry;
pub use error::{ApiError, CacheError, Result, ALREADY_EXISTS_TYPE_KEY};
pub use listing::{CacheKeyInfo, KeyLister, RestApi};
pub use mutable::VersionedKey;
pub use transport::{version_fingerprint, API_ACCEPT};
pub use upload::UploadCursor;
