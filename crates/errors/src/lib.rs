//! Error classification shared across the store.
//!
//! Failures that cross an API boundary are always tagged with an
//! [`ErrorMetadata`] so callers can branch on the `code` rather than on
//! transport-level detail. The transport-level error stays in the anyhow
//! context chain for diagnostics.

use std::borrow::Cow;

mod metrics;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// codebase to classify errors.
///
/// The msg is conveyed as the caller facing error message if it makes it to
/// the API boundary.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg DescriptorSchemeMismatch
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed connection descriptor or option value. Caller error, never
    /// retried.
    InvalidConfiguration,
    /// A request a replica permanently rejected. Not retried.
    BadRequest,
    /// The placement service could not be reached while opening a store.
    /// Recoverable by retrying the whole open.
    ClusterUnavailable,
    /// The timestamp service stayed unavailable past the retry budget.
    TimestampUnavailable,
    /// A route for a key could not be resolved within the retry budget.
    RouteResolutionFailed,
    /// The locally cached garbage-collection safepoint has not been refreshed
    /// within the trust window, so new reads cannot be admitted.
    PossiblyStaleSafepoint,
    /// A transaction's start timestamp is at or below the safepoint, so its
    /// snapshot may already have been garbage collected.
    SnapshotBelowSafepoint,
    /// Internal signal from the backoff controller. Converted to one of the
    /// codes above at the boundary of the operation that invoked it.
    RetryExhausted,
}

impl ErrorMetadata {
    /// Malformed open descriptor or option value.
    ///
    /// The short_msg should be a CapitalCamelCased tag describing the error
    /// (eg DescriptorSchemeMismatch). The msg should be a descriptive message
    /// targeted toward the operator.
    pub fn invalid_configuration(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidConfiguration,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A request a replica rejected as permanently invalid. Surfaced without
    /// consuming retry budget.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Placement service unreachable during open. Callers are expected to
    /// retry the whole open.
    pub fn cluster_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::ClusterUnavailable,
            short_msg: CLUSTER_UNAVAILABLE.into(),
            msg: msg.into(),
        }
    }

    /// Timestamp acquisition exhausted its retry budget.
    pub fn timestamp_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::TimestampUnavailable,
            short_msg: TIMESTAMP_UNAVAILABLE.into(),
            msg: msg.into(),
        }
    }

    /// Route resolution exhausted its retry budget during dispatch.
    pub fn route_resolution_failed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::RouteResolutionFailed,
            short_msg: ROUTE_RESOLUTION_FAILED.into(),
            msg: msg.into(),
        }
    }

    /// The cached safepoint is older than the staleness threshold.
    pub fn possibly_stale_safepoint() -> Self {
        Self {
            code: ErrorCode::PossiblyStaleSafepoint,
            short_msg: POSSIBLY_STALE_SAFEPOINT.into(),
            msg: POSSIBLY_STALE_SAFEPOINT_MSG.into(),
        }
    }

    /// A start timestamp at or below the current safepoint.
    pub fn snapshot_below_safepoint(start_ts: u64, safepoint: u64) -> Self {
        Self {
            code: ErrorCode::SnapshotBelowSafepoint,
            short_msg: SNAPSHOT_BELOW_SAFEPOINT.into(),
            msg: format!(
                "start timestamp {start_ts} is at or below the garbage collection safepoint \
                 {safepoint}; the snapshot may already have been reclaimed"
            )
            .into(),
        }
    }

    /// Retry budget or deadline exhausted. Internal - callers of a public
    /// operation see one of the other codes instead.
    pub fn retry_exhausted(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RetryExhausted,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_invalid_configuration(&self) -> bool {
        self.code == ErrorCode::InvalidConfiguration
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_cluster_unavailable(&self) -> bool {
        self.code == ErrorCode::ClusterUnavailable
    }

    pub fn is_timestamp_unavailable(&self) -> bool {
        self.code == ErrorCode::TimestampUnavailable
    }

    pub fn is_route_resolution_failed(&self) -> bool {
        self.code == ErrorCode::RouteResolutionFailed
    }

    pub fn is_possibly_stale_safepoint(&self) -> bool {
        self.code == ErrorCode::PossiblyStaleSafepoint
    }

    pub fn is_snapshot_below_safepoint(&self) -> bool {
        self.code == ErrorCode::SnapshotBelowSafepoint
    }

    pub fn is_retry_exhausted(&self) -> bool {
        self.code == ErrorCode::RetryExhausted
    }

    /// Return true if a caller may reasonably retry the whole operation
    /// later. Configuration and permanent logical errors are deterministic
    /// and retrying them cannot help.
    pub fn is_retriable_by_caller(&self) -> bool {
        match self.code {
            ErrorCode::InvalidConfiguration | ErrorCode::BadRequest => false,
            ErrorCode::ClusterUnavailable
            | ErrorCode::TimestampUnavailable
            | ErrorCode::RouteResolutionFailed
            | ErrorCode::PossiblyStaleSafepoint
            | ErrorCode::SnapshotBelowSafepoint
            | ErrorCode::RetryExhausted => true,
        }
    }

    pub fn custom_metric(&self) -> Option<&'static ::metrics::prometheus::IntCounter> {
        match self.code {
            ErrorCode::RetryExhausted => Some(&crate::metrics::RETRY_EXHAUSTED_TOTAL),
            ErrorCode::PossiblyStaleSafepoint => {
                Some(&crate::metrics::STALE_SAFEPOINT_REJECTION_TOTAL)
            },
            ErrorCode::SnapshotBelowSafepoint => {
                Some(&crate::metrics::BELOW_SAFEPOINT_REJECTION_TOTAL)
            },
            ErrorCode::InvalidConfiguration
            | ErrorCode::BadRequest
            | ErrorCode::ClusterUnavailable
            | ErrorCode::TimestampUnavailable
            | ErrorCode::RouteResolutionFailed => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_invalid_configuration(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_cluster_unavailable(&self) -> bool;
    fn is_timestamp_unavailable(&self) -> bool;
    fn is_route_resolution_failed(&self) -> bool;
    fn is_possibly_stale_safepoint(&self) -> bool;
    fn is_snapshot_below_safepoint(&self) -> bool;
    fn is_retry_exhausted(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_invalid_configuration(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_invalid_configuration)
    }

    fn is_bad_request(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_cluster_unavailable(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_cluster_unavailable)
    }

    fn is_timestamp_unavailable(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_timestamp_unavailable)
    }

    fn is_route_resolution_failed(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_route_resolution_failed)
    }

    fn is_possibly_stale_safepoint(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_possibly_stale_safepoint)
    }

    fn is_snapshot_below_safepoint(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_snapshot_below_safepoint)
    }

    fn is_retry_exhausted(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_retry_exhausted)
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }
}

pub const INTERNAL_ERROR: &str = "InternalError";
pub const INTERNAL_ERROR_MSG: &str = "The request couldn't be completed. Try again later.";
pub const CLUSTER_UNAVAILABLE: &str = "ClusterUnavailable";
pub const TIMESTAMP_UNAVAILABLE: &str = "TimestampUnavailable";
pub const ROUTE_RESOLUTION_FAILED: &str = "RouteResolutionFailed";
pub const POSSIBLY_STALE_SAFEPOINT: &str = "PossiblyStaleSafepoint";
pub const POSSIBLY_STALE_SAFEPOINT_MSG: &str = "The garbage collection safepoint has not been \
                                                refreshed recently enough to admit new reads. Try \
                                                again later.";
pub const SNAPSHOT_BELOW_SAFEPOINT: &str = "SnapshotBelowSafepoint";

#[cfg(any(test, feature = "testing"))]
mod arbitrary {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|code| match code {
                    ErrorCode::InvalidConfiguration => {
                        ErrorMetadata::invalid_configuration("invalid", "configuration")
                    },
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::ClusterUnavailable => {
                        ErrorMetadata::cluster_unavailable("unavailable")
                    },
                    ErrorCode::TimestampUnavailable => {
                        ErrorMetadata::timestamp_unavailable("timestamps unavailable")
                    },
                    ErrorCode::RouteResolutionFailed => {
                        ErrorMetadata::route_resolution_failed("no route")
                    },
                    ErrorCode::PossiblyStaleSafepoint => ErrorMetadata::possibly_stale_safepoint(),
                    ErrorCode::SnapshotBelowSafepoint => {
                        ErrorMetadata::snapshot_below_safepoint(1, 2)
                    },
                    ErrorCode::RetryExhausted => {
                        ErrorMetadata::retry_exhausted("exhausted", "retries")
                    },
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_classification_survives_anyhow_context(err in any::<ErrorMetadata>()) {
            let code = err.code;
            let wrapped = anyhow::anyhow!("transport detail: connection reset")
                .context(err)
                .context("while dispatching request");
            let observed = wrapped
                .downcast_ref::<ErrorMetadata>()
                .expect("metadata lost in context chain");
            assert_eq!(observed.code, code);
        }

        #[test]
        fn test_deterministic_errors_are_not_retriable(err in any::<ErrorMetadata>()) {
            let deterministic = matches!(
                err.code,
                ErrorCode::InvalidConfiguration | ErrorCode::BadRequest
            );
            assert_eq!(err.is_retriable_by_caller(), !deterministic);
        }
    }

    #[test]
    fn test_short_msg_falls_back_for_untagged_errors() {
        let err = anyhow::anyhow!("io error");
        assert_eq!(err.short_msg(), crate::INTERNAL_ERROR);
        assert!(!err.is_retry_exhausted());
    }
}
