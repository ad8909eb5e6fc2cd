//! Mutable keys on top of create-only storage.
//!
//! A mutable key `base` is stored as a series of immutable entries
//! `base#1`, `base#2`, ... and the newest committed one is its current value.
//! Writers race to commit the next version; the service accepts exactly one
//! commit per key, so a loser reloads and tries again on top of the winner.
//!
//! A writer that reserves a version and then dies blocks that version
//! forever. Once a version has stayed in conflict for longer than the
//! staleness window it is presumed abandoned and skipped. If the writer was
//! merely slow and commits later, the skipped version and its successor hold
//! divergent values.

use std::{fmt, future::Future, str::FromStr, time::Duration};

use actions_cache_blob::Blob;
use actions_cache_utils::Backoff;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::Cache,
    cancel::sleep,
    entry::Entry,
    error::{CacheError, Result},
};

const VERSION_SEPARATOR: char = '#';

/// `base#N` with `N >= 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    pub base: String,
    pub version: u64,
}

impl VersionedKey {
    pub fn new(base: impl Into<String>, version: u64) -> Self {
        Self {
            base: base.into(),
            version,
        }
    }

    /// Prefix matching every version of `base`.
    pub fn prefix(base: &str) -> String {
        format!("{base}{VERSION_SEPARATOR}")
    }
}

impl fmt::Display for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{VERSION_SEPARATOR}{}", self.base, self.version)
    }
}

impl FromStr for VersionedKey {
    type Err = CacheError;

    /// Splits on the last `#`, so bases may themselves contain `#`.
    fn from_str(key: &str) -> Result<Self> {
        let (base, version) = key
            .rsplit_once(VERSION_SEPARATOR)
            .ok_or_else(|| CacheError::InvalidKey(format!("{key:?} has no version suffix")))?;
        let version = version
            .parse::<u64>()
            .map_err(|e| CacheError::InvalidKey(format!("{key:?}: {e}")))?;
        Ok(Self::new(base, version))
    }
}

/// Version number of `entry` as a version of `base`, 0 when there is no
/// entry.
///
/// A match under `base#` whose suffix is not a number belongs to some other
/// key. It is never the current value, so it fails the save.
fn current_version(base: &str, entry: Option<&Entry>) -> Result<u64> {
    let Some(entry) = entry else {
        return Ok(0);
    };
    let suffix = entry
        .key
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix(VERSION_SEPARATOR));
    match suffix.map(str::parse::<u64>) {
        Some(Ok(version)) => Ok(version),
        Some(Err(e)) => Err(CacheError::InvalidResponse(format!(
            "latest entry {:?} for {base:?} has an invalid version: {e}",
            entry.key
        ))),
        None => Err(CacheError::InvalidResponse(format!(
            "latest entry {:?} is not a version of {base:?}",
            entry.key
        ))),
    }
}

/// Conflict clock for the version currently being attempted.
struct ConflictClock {
    version: u64,
    started: Instant,
}

impl Cache {
    /// Replaces the value of the mutable key `base` with the output of
    /// `mutate`, which receives the current value (if any).
    ///
    /// `mutate` runs once per attempt and must be safe to call repeatedly.
    /// Its failures are returned as-is without retrying. Returns the
    /// committed versioned key.
    #[tracing::instrument(skip(self, ctx, mutate))]
    pub async fn save_mutable<F, Fut, B>(
        &self,
        ctx: &CancellationToken,
        base: &str,
        staleness: Duration,
        mut mutate: F,
    ) -> Result<String>
    where
        F: FnMut(Option<Entry>) -> Fut,
        Fut: Future<Output = anyhow::Result<B>>,
        B: Blob,
    {
        let prefix = VersionedKey::prefix(base);
        let mut backoff = Backoff::new(self.config().conflict_backoff);
        let mut floor = 0u64;
        let mut clock: Option<ConflictClock> = None;

        loop {
            if ctx.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let latest = self.load(ctx, &[prefix.as_str()]).await?;
            let target = (current_version(base, latest.as_ref())? + 1).max(floor);
            if clock.as_ref().is_some_and(|c| c.version != target) {
                clock = None;
            }

            let blob = mutate(latest).await.map_err(CacheError::Mutator)?;
            let key = VersionedKey::new(base, target).to_string();
            let err = match self.save(ctx, &key, &blob).await {
                Ok(()) => return Ok(key),
                Err(err) if err.is_conflict() => err,
                Err(err) => return Err(err),
            };

            let started = clock
                .get_or_insert_with(|| ConflictClock {
                    version: target,
                    started: Instant::now(),
                })
                .started;
            let elapsed = started.elapsed();
            if elapsed < staleness {
                let delay = backoff.next_delay();
                debug!(
                    key = %key,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "version taken, retrying"
                );
                sleep(ctx, delay).await?;
            } else {
                warn!(
                    key = %key,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "reservation presumed abandoned, skipping version"
                );
                floor = target + 1;
                clock = None;
                backoff.reset();
            }
        }
    }
}
