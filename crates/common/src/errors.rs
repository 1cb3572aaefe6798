use errors::ErrorMetadata;

use crate::metrics::log_errors_reported_total;

/// Log an unexpected error and bump its metrics. Call this for errors that
/// are swallowed rather than propagated, so they still show up in
/// observability.
pub fn report_error(err: &mut anyhow::Error) {
    log_errors_reported_total();
    if let Some(metric) = err
        .downcast_ref::<ErrorMetadata>()
        .and_then(ErrorMetadata::custom_metric)
    {
        metrics::log_counter(metric, 1);
    }
    tracing::error!("Caught error (RUST_BACKTRACE=1 for full trace): {err:#}");
}
