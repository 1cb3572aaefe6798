//! Tunable limits and parameters for the store.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each one should have a comment explaining what it's for and the
//! bounds if applicable so an oncall engineer can adjust it safely.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Set a consistent thread stack size regardless of environment. This is
/// 2x Rust's default: https://doc.rust-lang.org/nightly/std/thread/index.html#stack-size
pub static RUNTIME_STACK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_STACK_SIZE", 4 * 1024 * 1024));

/// 0 -> default (number of cores)
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));

/// How often the safepoint coordinator reloads the persisted safepoint.
/// Must stay well below `SAFEPOINT_STALENESS_THRESHOLD` so several refreshes
/// can be missed before visibility is denied.
pub static SAFEPOINT_REFRESH_INTERVAL: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("SAFEPOINT_REFRESH_INTERVAL_SECONDS", 5))
});

/// Age past which the locally cached safepoint is treated as untrustworthy
/// and new reads are rejected. Keep this a large multiple of
/// `SAFEPOINT_REFRESH_INTERVAL`.
pub static SAFEPOINT_STALENESS_THRESHOLD: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("SAFEPOINT_STALENESS_THRESHOLD_SECONDS", 100))
});

/// Cumulative deadline for acquiring one timestamp from the clock service,
/// covering all retries.
pub static TIMESTAMP_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("TIMESTAMP_MAX_BACKOFF_MS", 5000)));

/// Cumulative deadline for one dispatched request, covering all retries.
pub static DISPATCH_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("DISPATCH_MAX_BACKOFF_MS", 20000)));

/// Per-request network timeout handed to the replica RPC client.
pub static KV_REQUEST_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("KV_REQUEST_TIMEOUT_MS", 10000)));

/// Retry budget for clock service failures within one logical operation.
pub static CLOCK_SERVICE_RETRY_LIMIT: LazyLock<u32> =
    LazyLock::new(|| env_config("CLOCK_SERVICE_RETRY_LIMIT", 10));

/// First clock service retry delay; doubles up to the cap below.
pub static CLOCK_SERVICE_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("CLOCK_SERVICE_INITIAL_BACKOFF_MS", 100)));

/// Cap on a single clock service retry delay.
pub static CLOCK_SERVICE_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("CLOCK_SERVICE_MAX_BACKOFF_MS", 3000)));

/// Retry budget for stale-route signals. Splits and leader changes come in
/// bursts, so this is deliberately generous and independent of the other
/// budgets.
pub static STALE_ROUTE_RETRY_LIMIT: LazyLock<u32> =
    LazyLock::new(|| env_config("STALE_ROUTE_RETRY_LIMIT", 16));

/// First stale-route retry delay. Re-resolution is cheap, so start small.
pub static STALE_ROUTE_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("STALE_ROUTE_INITIAL_BACKOFF_MS", 2)));

/// Cap on a single stale-route retry delay.
pub static STALE_ROUTE_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("STALE_ROUTE_MAX_BACKOFF_MS", 500)));

/// Retry budget for overloaded-replica responses.
pub static REPLICA_BUSY_RETRY_LIMIT: LazyLock<u32> =
    LazyLock::new(|| env_config("REPLICA_BUSY_RETRY_LIMIT", 8));

/// First overloaded-replica retry delay.
pub static REPLICA_BUSY_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("REPLICA_BUSY_INITIAL_BACKOFF_MS", 50)));

/// Cap on a single overloaded-replica retry delay.
pub static REPLICA_BUSY_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("REPLICA_BUSY_MAX_BACKOFF_MS", 5000)));

/// Retry budget for lock conflicts observed by a dispatched request.
pub static LOCK_CONFLICT_RETRY_LIMIT: LazyLock<u32> =
    LazyLock::new(|| env_config("LOCK_CONFLICT_RETRY_LIMIT", 10));

/// First lock-conflict retry delay.
pub static LOCK_CONFLICT_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("LOCK_CONFLICT_INITIAL_BACKOFF_MS", 10)));

/// Cap on a single lock-conflict retry delay.
pub static LOCK_CONFLICT_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("LOCK_CONFLICT_MAX_BACKOFF_MS", 3000)));

/// Retry budget for generic RPC timeouts and transport failures.
pub static RPC_TIMEOUT_RETRY_LIMIT: LazyLock<u32> =
    LazyLock::new(|| env_config("RPC_TIMEOUT_RETRY_LIMIT", 8));

/// First transport-failure retry delay.
pub static RPC_TIMEOUT_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("RPC_TIMEOUT_INITIAL_BACKOFF_MS", 25)));

/// Cap on a single transport-failure retry delay.
pub static RPC_TIMEOUT_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("RPC_TIMEOUT_MAX_BACKOFF_MS", 2000)));

/// How often the GC trigger advances the persisted safepoint candidate when
/// GC is enabled.
pub static GC_RUN_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("GC_RUN_INTERVAL_SECONDS", 60)));

/// How far behind current time the GC trigger keeps the safepoint. Data
/// versions older than this become eligible for collection.
pub static GC_LIFETIME: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("GC_LIFETIME_SECONDS", 600)));
