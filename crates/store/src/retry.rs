//! Retry accounting for one logical operation.
//!
//! A [`RetryContext`] lives for exactly one operation (one timestamp
//! acquisition, one dispatched request, one commit). Each failure kind gets
//! its own budget and its own backoff curve, so a burst of cheap stale-route
//! retries doesn't eat the budget for, say, lock conflicts. A cumulative
//! deadline bounds the whole operation regardless of which kinds fired.

use std::{
    collections::BTreeMap,
    time::Duration,
};

use common::{
    backoff::Backoff,
    knobs::{
        CLOCK_SERVICE_INITIAL_BACKOFF,
        CLOCK_SERVICE_MAX_BACKOFF,
        CLOCK_SERVICE_RETRY_LIMIT,
        LOCK_CONFLICT_INITIAL_BACKOFF,
        LOCK_CONFLICT_MAX_BACKOFF,
        LOCK_CONFLICT_RETRY_LIMIT,
        REPLICA_BUSY_INITIAL_BACKOFF,
        REPLICA_BUSY_MAX_BACKOFF,
        REPLICA_BUSY_RETRY_LIMIT,
        RPC_TIMEOUT_INITIAL_BACKOFF,
        RPC_TIMEOUT_MAX_BACKOFF,
        RPC_TIMEOUT_RETRY_LIMIT,
        STALE_ROUTE_INITIAL_BACKOFF,
        STALE_ROUTE_MAX_BACKOFF,
        STALE_ROUTE_RETRY_LIMIT,
    },
    runtime::{
        Instant,
        Runtime,
    },
};
use errors::ErrorMetadata;
use futures::{
    select_biased,
    FutureExt,
};
use tokio::sync::watch;

use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureKind {
    ClockService,
    StaleRoute,
    ReplicaBusy,
    LockConflict,
    RpcTimeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClockService => "clock_service",
            Self::StaleRoute => "stale_route",
            Self::ReplicaBusy => "replica_busy",
            Self::LockConflict => "lock_conflict",
            Self::RpcTimeout => "rpc_timeout",
        }
    }

    fn budget(&self) -> u32 {
        match self {
            Self::ClockService => *CLOCK_SERVICE_RETRY_LIMIT,
            Self::StaleRoute => *STALE_ROUTE_RETRY_LIMIT,
            Self::ReplicaBusy => *REPLICA_BUSY_RETRY_LIMIT,
            Self::LockConflict => *LOCK_CONFLICT_RETRY_LIMIT,
            Self::RpcTimeout => *RPC_TIMEOUT_RETRY_LIMIT,
        }
    }

    fn new_backoff(&self) -> Backoff {
        let (initial, max) = match self {
            Self::ClockService => (*CLOCK_SERVICE_INITIAL_BACKOFF, *CLOCK_SERVICE_MAX_BACKOFF),
            Self::StaleRoute => (*STALE_ROUTE_INITIAL_BACKOFF, *STALE_ROUTE_MAX_BACKOFF),
            Self::ReplicaBusy => (*REPLICA_BUSY_INITIAL_BACKOFF, *REPLICA_BUSY_MAX_BACKOFF),
            Self::LockConflict => (*LOCK_CONFLICT_INITIAL_BACKOFF, *LOCK_CONFLICT_MAX_BACKOFF),
            Self::RpcTimeout => (*RPC_TIMEOUT_INITIAL_BACKOFF, *RPC_TIMEOUT_MAX_BACKOFF),
        };
        Backoff::new(initial, max)
    }
}

struct KindState {
    backoff: Backoff,
    attempts: u32,
}

pub struct RetryContext<RT: Runtime> {
    rt: RT,
    started: Instant,
    deadline: Duration,
    kinds: BTreeMap<FailureKind, KindState>,
    history: Vec<String>,
    cancel: Option<watch::Receiver<bool>>,
}

impl<RT: Runtime> RetryContext<RT> {
    pub fn new(rt: RT, deadline: Duration) -> Self {
        let started = rt.monotonic_now();
        Self {
            rt,
            started,
            deadline,
            kinds: BTreeMap::new(),
            history: Vec::new(),
            cancel: None,
        }
    }

    /// Attach a cancellation signal. Once the sender flips it to true (or
    /// drops), the next `backoff` call fails instead of sleeping.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn total_attempts(&self) -> u32 {
        self.kinds.values().map(|s| s.attempts).sum()
    }

    /// Record a failure of `kind` and sleep for its next backoff delay.
    /// Returns `Err` with a `RetryExhausted` error carrying the full failure
    /// history when the kind's budget, the cumulative deadline, or the
    /// cancellation signal says to stop.
    pub async fn backoff(&mut self, kind: FailureKind, err: anyhow::Error) -> anyhow::Result<()> {
        self.history.push(format!("{}: {err:#}", kind.as_str()));
        tracing::debug!(
            kind = kind.as_str(),
            attempts = self.total_attempts() + 1,
            "operation failed, will retry: {err:#}",
        );
        metrics::log_retry();
        if self.is_canceled() {
            return Err(self.exhausted("operation canceled"));
        }
        let budget = kind.budget();
        let state = self.kinds.entry(kind).or_insert_with(|| KindState {
            backoff: kind.new_backoff(),
            attempts: 0,
        });
        state.attempts += 1;
        let over_budget = state.attempts > budget;
        let delay = self.rt.with_rng(|rng| state.backoff.fail(rng));
        if over_budget {
            let reason = format!("{} retry budget ({budget}) exhausted", kind.as_str());
            return Err(self.exhausted(&reason));
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.deadline || elapsed + delay > self.deadline {
            let reason = format!(
                "deadline ({:?}) exceeded after {elapsed:?}",
                self.deadline
            );
            return Err(self.exhausted(&reason));
        }
        let mut wait = self.rt.wait(delay);
        let canceled = match self.cancel.as_mut() {
            Some(cancel) => {
                select_biased! {
                    // A dropped sender also means the owner is gone.
                    _ = cancel.changed().fuse() => true,
                    _ = wait => false,
                }
            },
            None => {
                wait.await;
                false
            },
        };
        if canceled {
            return Err(self.exhausted("operation canceled"));
        }
        Ok(())
    }

    fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| *c.borrow())
    }

    fn exhausted(&self, reason: &str) -> anyhow::Error {
        metrics::log_retry_exhausted();
        anyhow::anyhow!("failures: [{}]", self.history.join("; ")).context(
            ErrorMetadata::retry_exhausted(
                "RetryExhausted",
                format!("{reason}; last failure: {}", self.history.last().cloned().unwrap_or_default()),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::runtime::testing::TestRuntime;
    use errors::ErrorMetadataAnyhowExt;
    use tokio::sync::watch;

    use super::{
        FailureKind,
        RetryContext,
    };

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_is_per_kind() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let mut ctx = RetryContext::new(rt, Duration::from_secs(3600));
        let budget = *common::knobs::STALE_ROUTE_RETRY_LIMIT;
        for _ in 0..budget {
            ctx.backoff(FailureKind::StaleRoute, anyhow::anyhow!("moved")).await?;
        }
        // The stale-route budget is gone, but other kinds still have theirs.
        ctx.backoff(FailureKind::LockConflict, anyhow::anyhow!("locked")).await?;
        let err = ctx
            .backoff(FailureKind::StaleRoute, anyhow::anyhow!("moved"))
            .await
            .unwrap_err();
        assert!(err.is_retry_exhausted(), "{err:?}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_deadline_fails_without_sleeping() {
        let rt = TestRuntime::new();
        let mut ctx = RetryContext::new(rt, Duration::ZERO);
        let err = ctx
            .backoff(FailureKind::ClockService, anyhow::anyhow!("unreachable"))
            .await
            .unwrap_err();
        assert!(err.is_retry_exhausted(), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retries() {
        let rt = TestRuntime::new();
        let (tx, rx) = watch::channel(false);
        let mut ctx = RetryContext::new(rt, Duration::from_secs(3600)).with_cancel(rx);
        tx.send(true).unwrap();
        let err = ctx
            .backoff(FailureKind::ReplicaBusy, anyhow::anyhow!("busy"))
            .await
            .unwrap_err();
        assert!(err.is_retry_exhausted(), "{err:?}");
        assert!(format!("{err:?}").contains("canceled"));
    }
}
