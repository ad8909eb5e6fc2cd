use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};

/// Runs `fut` unless `ctx` is cancelled first, in which case `fut` is dropped
/// and `Cancelled` is returned.
pub(crate) async fn cancellable<F, T>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(CacheError::Cancelled),
        res = fut => res,
    }
}

pub(crate) async fn sleep(ctx: &CancellationToken, duration: Duration) -> Result<()> {
    cancellable(ctx, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}
