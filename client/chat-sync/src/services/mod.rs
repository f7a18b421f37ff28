pub mod pagination;
pub mod polling;
pub mod read_tracker;
pub mod realtime_ingester;
pub mod send_coordinator;

pub use pagination::{PageOutcome, PaginationLoader};
pub use polling::{PollingFallback, TickOutcome};
pub use read_tracker::ReadTracker;
pub use realtime_ingester::{Ingested, RealtimeIngester};
pub use send_coordinator::SendCoordinator;

use resilience::{with_retry_if, with_timeout_result, CallPolicy};
use std::future::Future;

use crate::error::{BackendError, BackendResult};

/// Run one backend call under `policy`: every attempt is bounded by the
/// policy timeout, and transient failures are retried when the policy allows.
pub(crate) async fn call_with_policy<F, Fut, T>(policy: &CallPolicy, mut f: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let timeout = policy.timeout.duration;
    match &policy.retry {
        Some(retry) => with_retry_if(retry.clone(), BackendError::is_transient, || {
            with_timeout_result(timeout, f())
        })
        .await
        .map_err(|e| e.into_inner()),
        None => with_timeout_result(timeout, f()).await,
    }
}
