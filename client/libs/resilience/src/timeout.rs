/// Timeout wrapper for async operations
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError(duration))
}

/// Execute a fallible future with timeout, folding the elapsed case into the caller's error type
pub async fn with_timeout_result<F, T, E>(duration: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(E::from(TimeoutError(duration))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum CallError {
        Failed,
        TimedOut,
    }

    impl From<TimeoutError> for CallError {
        fn from(_: TimeoutError) -> Self {
            CallError::TimedOut
        }
    }

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert_eq!(result, Err(TimeoutError(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_timeout_result_passes_operation_error_through() {
        let result: Result<i32, CallError> =
            with_timeout_result(Duration::from_secs(1), async { Err(CallError::Failed) }).await;
        assert_eq!(result, Err(CallError::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_result_maps_elapsed() {
        let result: Result<i32, CallError> = with_timeout_result(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(1)
        })
        .await;
        assert_eq!(result, Err(CallError::TimedOut));
    }
}
