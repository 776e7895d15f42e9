//! Bounded retry with exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use dxfuse_common::{Error, Result};

/// First backoff delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Backoff never exceeds this.
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Whether a failed call is worth repeating. Authorization and
/// permission failures are not: retrying cannot change the answer.
fn retryable(err: &Error) -> bool {
    matches!(err, Error::IO(_) | Error::Timeout(_))
}

/// Run `op` up to `attempts` times, sleeping between failures.
///
/// The closure receives the 1-based attempt number, which callers use
/// for logging.
pub async fn retry_with_backoff<T, F, Fut>(op_name: &str, attempts: u32, op: F) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay: Duration = BACKOFF_BASE;
    let mut last_err: Error = Error::IO(format!("{}: no attempts made", op_name));

    for attempt in 1..=attempts.max(1) {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) && attempt < attempts.max(1) => {
                tracing::warn!(
                    "{} failed on attempt {}/{}: {}; retrying in {:?}",
                    op_name,
                    attempt,
                    attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_CAP);
                last_err = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff("op", 3, |_attempt| {
            let n: u32 = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::IO("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff("op", 3, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Timeout("slow".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff("op", 3, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Auth("expired".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
