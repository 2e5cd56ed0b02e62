//! Bounded retry with exponential backoff and jitter.
//!
//! Only transient errors ([`ApiError::is_transient`]) are retried; permanent
//! errors return immediately. Callers above the transport layer never loop
//! themselves.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::ApiError;

/// Maximum number of attempts for a single logical call.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before retry number `attempt` (0-based): 2^attempt seconds plus up
/// to one second of jitter so concurrent table cycles do not retry in
/// lockstep.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(1u64 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..1_000);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Run `op` until it succeeds, fails permanently, or exhausts
/// [`MAX_ATTEMPTS`].
pub async fn retry_transient<T, Fut, F>(label: &str, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                // A server-supplied Retry-After beats our own schedule.
                let delay = err
                    .retry_after_hint()
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| backoff_delay(attempt));
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt + 1,
                    MAX_ATTEMPTS,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let d0 = backoff_delay(0);
        let d2 = backoff_delay(2);
        assert!(d0 >= Duration::from_secs(1) && d0 < Duration::from_secs(2));
        assert!(d2 >= Duration::from_secs(4) && d2 < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        // Attempt numbers beyond the cap must not overflow the shift.
        let d = backoff_delay(40);
        assert!(d <= Duration::from_secs(65));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("test op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError::Throttled {
                        retry_after: Some(1),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("test op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Transport("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("test op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ApiError::Protocol {
                    status: 400,
                    message: "bad request".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
