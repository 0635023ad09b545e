//! Exponential retry delays for registry calls.

use std::future::Future;
use std::time::Duration;

/// Number of retries after the first failed registry attempt.
pub const REGISTER_RETRIES: u32 = 3;

const BASE: Duration = Duration::from_millis(10);
const MAX: Duration = Duration::from_secs(5);

/// Delay before retry `attempt`; zero for the first try, then doubling from
/// the base and capped.
#[must_use]
pub fn delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    BASE.saturating_mul(factor).min(MAX)
}

/// Runs `op` until it succeeds or `retries` retries have failed, sleeping
/// [`delay`] between attempts. Returns the last error.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry<T, E, F, Fut>(retries: u32, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        tokio::time::sleep(delay(attempt)).await;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries => {
                tracing::debug!(attempt, error = %e, "retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
