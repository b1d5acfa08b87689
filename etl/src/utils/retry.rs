use crate::utils::time::sleep_with_jitter;
use std::fmt::Display;
use std::future::Future;
use tracing::warn;

/// Runs `operation` until it succeeds, `should_retry` rejects the error, or
/// `retries` extra attempts are used up. The delay doubles after each attempt.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    mut retries: u32,
    base_delay_ms: u64,
    should_retry: P,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut delay = base_delay_ms;
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if retries == 0 || !should_retry(&e) {
                    return Err(e);
                }

                warn!(attempt, retries_left = retries, delay_ms = delay, error = %e, "Retrying after failure");
                retries -= 1;
                attempt += 1;
                sleep_with_jitter(delay, delay / 2).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}
