use backoff::ExponentialBackoffBuilder;
use std::time::Duration;

/// §4.1: "retries with exponential backoff (start 1s, cap 30s)".
pub fn reconnect_backoff() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(None)
        .build()
}
