//! Upper bounds for awaited operations.

use std::future::Future;
use std::time::Duration;

/// Returned when an operation did not finish within its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Await `future`, giving up after `limit`.
///
/// A zero `limit` disables the deadline.
///
/// # Errors
///
/// Returns [`DeadlineExceeded`] when the future is still pending at `limit`.
pub async fn with_deadline<F, T>(limit: Duration, future: F) -> Result<T, DeadlineExceeded>
where
    F: Future<Output = T>,
{
    if limit.is_zero() {
        return Ok(future.await);
    }
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| DeadlineExceeded(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_deadline(Duration::from_millis(200), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_hung_future_times_out() {
        let limit = Duration::from_millis(20);
        let result = with_deadline(limit, std::future::pending::<()>()).await;
        assert_eq!(result, Err(DeadlineExceeded(limit)));
    }

    #[tokio::test]
    async fn test_zero_limit_disables_deadline() {
        let result = with_deadline(Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            "done"
        })
        .await;
        assert_eq!(result, Ok("done"));
    }
}
