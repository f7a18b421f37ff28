use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,chat_sync=debug,resilience=info";

pub fn init_tracing() {
    fmt().with_env_filter(env_filter()).with_target(false).init();
}

/// Same as [`init_tracing`] but tolerates a subscriber that is already installed
/// by the embedding app. Returns whether this call installed it.
pub fn try_init_tracing() -> bool {
    fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init()
        .is_ok()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
