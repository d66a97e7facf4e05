// =============================================================================
// utils/retry.rs
// =============================================================================
// Helper: retry_blocking - bounded retries with a fixed backoff between
// attempts. Used for engine-native backup copies where the destination may
// still be settling (an "output file already exists" race after a delete).
// =============================================================================

use std::time::Duration;

use anyhow::Result;

/// Max attempts including the first
pub const COPY_MAX_RETRIES: usize = 3;
/// Delay between attempts (ms)
pub const COPY_BACKOFF_MS: u64 = 100;

/// Run `op` up to `max_attempts` times, sleeping `backoff` between failures.
///
/// Runs on the calling thread; only use from blocking contexts, never from
/// an async task.
pub fn retry_blocking<F, T>(max_attempts: usize, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                tracing::debug!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt,
                    max_attempts,
                    e,
                    backoff.as_millis()
                );
                std::thread::sleep(backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_success_on_first_attempt() {
        let result = retry_blocking(3, Duration::from_millis(1), || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_retry_eventual_success() {
        let mut calls = 0;
        let result = retry_blocking(3, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 {
                Err(anyhow::anyhow!("not yet"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut calls = 0;
        let result: Result<i32> = retry_blocking(3, Duration::from_millis(1), || {
            calls += 1;
            Err(anyhow::anyhow!("permanent failure"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
