// Bounded retry loops for readiness, presence and status polling
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::Result;

/// Evaluates `check` until it reports true or `max_attempts` evaluations have
/// been made, sleeping `interval` between attempts.
///
/// A positive check returns immediately with no residual sleep, and no sleep
/// follows the last attempt. `max_attempts == 0` means exactly one
/// evaluation, no retries.
pub async fn poll_until<F, Fut>(mut check: F, interval: Duration, max_attempts: u32) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if max_attempts == 0 {
        return check().await;
    }
    for attempt in 1..=max_attempts {
        if check().await {
            return true;
        }
        if attempt < max_attempts {
            sleep(interval).await;
        }
    }
    false
}

/// Fallible variant of [`poll_until`]: a check returning `Err` aborts the
/// loop immediately and propagates the error.
pub async fn try_poll_until<F, Fut>(
    mut check: F,
    interval: Duration,
    max_attempts: u32,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    if max_attempts == 0 {
        return check().await;
    }
    for attempt in 1..=max_attempts {
        if check().await? {
            return Ok(true);
        }
        if attempt < max_attempts {
            sleep(interval).await;
        }
    }
    Ok(false)
}
