//! Common functions for metrics logging.
//!
//! We follow [Prometheus's conventions](https://prometheus.io/docs/practices/naming/)
//! for metric names. In particular,
//!
//! 1. Metrics may only contain alphanumerics and underscores.
//! 2. Metrics are automatically prefixed with `SERVICE_NAME`.
//! 3. Suffix metrics with their units (e.g. `_seconds`, `_total`).
//!
//! All metrics code within a crate goes in a `metrics` module. The interface
//! to this module should be high level (e.g. "this event happened") rather
//! than logging an `f64` to a particular metric name.

use std::{
    env,
    sync::LazyLock,
};

use prometheus::Registry;

mod macros;
mod reporting;

pub use paste::paste;
pub use prometheus;

pub use crate::reporting::{
    log_counter,
    log_gauge,
};

/// Prefix applied to every registered metric name.
pub static SERVICE_NAME: LazyLock<String> =
    LazyLock::new(|| env::var("MERIDIAN_SERVICE_NAME").unwrap_or_else(|_| "meridian".to_owned()));

/// Process-wide registry all `register_meridian_*` macros register against.
pub static MERIDIAN_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    Registry::new_custom(Some(SERVICE_NAME.clone()), None)
        .expect("Failed to create metrics registry")
});
