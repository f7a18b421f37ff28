/// Resilience patterns for the chat client
///
/// This library bounds and paces every call the client makes to the backing store:
/// - **Timeout**: Enforces time limits on remote calls
/// - **Retry**: Bounded exponential backoff with jitter for idempotent writes
/// - **Jitter**: Spreads periodic work (polling) so devices don't tick in lockstep
/// - **Preset Policies**: Pre-tuned settings per call type (send, poll, history, read marker)
///
/// # Example: Read Marker Upsert with Retry
///
/// ```rust,no_run
/// use resilience::{presets, with_retry};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let policy = presets::read_marker_policy(Duration::from_secs(10));
///     let retry = policy.retry.unwrap_or_default();
///
///     let result = with_retry(retry, || async {
///         // Your upsert here
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```
///
/// # Example: Poll Tick with Timeout
///
/// ```rust,no_run
/// use resilience::{presets, timeout::with_timeout};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let policy = presets::poll_policy(Duration::from_secs(5));
///
///     let result = with_timeout(policy.timeout.duration, async {
///         // Your fetch here
///         42
///     })
///     .await;
/// }
/// ```

pub mod jitter;
pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use jitter::{jittered, JitteredInterval};
pub use presets::{history_policy, poll_policy, read_marker_policy, send_policy, CallPolicy};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutConfig, TimeoutError};
