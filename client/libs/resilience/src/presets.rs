/// Preset call policies for the chat client's remote calls
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Policy bundle for one call type
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: TimeoutConfig,
    pub retry: Option<RetryConfig>,
}

impl CallPolicy {
    fn new(timeout: Duration, retry: Option<RetryConfig>) -> Self {
        Self {
            timeout: TimeoutConfig { duration: timeout },
            retry,
        }
    }
}

/// Outgoing message inserts
///
/// - No automatic retry: the send path has exactly one fallback insert and then
///   surfaces the failure, so repeated automatic retries can't duplicate a send
pub fn send_policy(timeout: Duration) -> CallPolicy {
    CallPolicy::new(timeout, None)
}

/// Gap-filling poll ticks
///
/// - No retry: the next tick is the retry
pub fn poll_policy(timeout: Duration) -> CallPolicy {
    CallPolicy::new(timeout, None)
}

/// Backward history pages
///
/// - No retry: the user re-requests older history explicitly
pub fn history_policy(timeout: Duration) -> CallPolicy {
    CallPolicy::new(timeout, None)
}

/// Read marker upserts
///
/// - Retry: 2 attempts with jitter (monotonic upserts are safe to repeat)
pub fn read_marker_policy(timeout: Duration) -> CallPolicy {
    CallPolicy::new(
        timeout,
        Some(RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }),
    )
}
