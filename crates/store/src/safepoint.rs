//! Safepoint tracking.
//!
//! Garbage collection continually advances a cluster-wide safepoint; data
//! versions at or below it may be physically reclaimed at any moment. Every
//! store handle keeps a local copy of the safepoint and refreshes it on a
//! fixed cadence. Reads are admitted against the local copy, but only while
//! it is fresh: if the refresh loop stops reporting in for longer than the
//! staleness threshold we can no longer prove a snapshot version is safe, so
//! visibility checks start rejecting.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    knobs::{
        SAFEPOINT_REFRESH_INTERVAL,
        SAFEPOINT_STALENESS_THRESHOLD,
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
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    clients::{
        ConfigSession,
        PersistedConfig,
    },
    metrics,
};

/// Key under which the last collected safepoint is persisted in the
/// configuration store.
pub const SAFEPOINT_CONFIG_KEY: &str = "gc_saved_safepoint";

struct SafepointState {
    current: u64,
    last_refreshed_at: Instant,
}

/// Locally cached safepoint plus the time it was last confirmed against the
/// configuration store.
pub struct SafepointTracker {
    inner: Mutex<SafepointState>,
}

impl SafepointTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Mutex::new(SafepointState {
                current: 0,
                last_refreshed_at: now,
            }),
        }
    }

    /// Return the current safepoint if it is fresh enough to admit a read,
    /// or a `PossiblyStaleSafepoint` error if not.
    pub fn check_visibility(&self) -> anyhow::Result<u64> {
        let (current, last_refreshed_at) = {
            let inner = self.inner.lock();
            (inner.current, inner.last_refreshed_at)
        };
        let age = last_refreshed_at.elapsed();
        if age > *SAFEPOINT_STALENESS_THRESHOLD {
            metrics::log_stale_safepoint_rejection();
            return Err(anyhow::anyhow!("safepoint last refreshed {age:?} ago")
                .context(ErrorMetadata::possibly_stale_safepoint()));
        }
        Ok(current)
    }

    pub fn current(&self) -> u64 {
        self.inner.lock().current
    }

    /// Install a freshly loaded safepoint. The safepoint never moves
    /// backwards; a regressed read keeps the old value but still counts as a
    /// successful refresh.
    fn advance(&self, new_value: u64, now: Instant) {
        let mut inner = self.inner.lock();
        if new_value < inner.current {
            tracing::warn!(
                "loaded safepoint {new_value} is behind cached {}, keeping cached value",
                inner.current,
            );
        } else {
            inner.current = new_value;
        }
        inner.last_refreshed_at = now;
        metrics::log_safepoint(inner.current);
    }

    /// Record a failed refresh attempt without touching the value. The
    /// freshness clock deliberately restarts here too: staleness measures
    /// time since we last *tried and heard back or gave up*, bounded by the
    /// loop cadence, so one slow poll doesn't instantly trip the threshold.
    fn touch(&self, now: Instant) {
        self.inner.lock().last_refreshed_at = now;
    }
}

/// Background loop keeping a [`SafepointTracker`] refreshed from the
/// configuration store. Runs until `stop_rx` flips to true.
///
/// Any error tears the config session down and starts a new one; the store
/// stays usable throughout, degrading only once the staleness threshold
/// passes without a successful refresh.
pub(crate) async fn go_refresh_safepoint<RT: Runtime>(
    rt: RT,
    config: Arc<dyn PersistedConfig>,
    tracker: Arc<SafepointTracker>,
    mut stop_rx: watch::Receiver<bool>,
) {
    'session: loop {
        if *stop_rx.borrow() {
            return;
        }
        let session = match config.session().await {
            Ok(session) => session,
            Err(e) => {
                tracker.touch(rt.monotonic_now());
                metrics::log_safepoint_refresh(false);
                tracing::warn!("failed to open safepoint refresh session: {e:#}");
                if !wait_or_stop(&rt, &mut stop_rx, *SAFEPOINT_REFRESH_INTERVAL).await {
                    return;
                }
                continue 'session;
            },
        };
        tracing::info!("safepoint refresh session established");
        loop {
            if *stop_rx.borrow() {
                return;
            }
            match load_safepoint(session.as_ref()).await {
                Ok(value) => {
                    tracker.advance(value, rt.monotonic_now());
                    metrics::log_safepoint_refresh(true);
                    tracing::trace!("refreshed safepoint to {}", tracker.current());
                },
                Err(e) => {
                    tracker.touch(rt.monotonic_now());
                    metrics::log_safepoint_refresh(false);
                    tracing::warn!("failed to load safepoint, recreating session: {e:#}");
                    if !wait_or_stop(&rt, &mut stop_rx, *SAFEPOINT_REFRESH_INTERVAL).await {
                        return;
                    }
                    continue 'session;
                },
            }
            if !wait_or_stop(&rt, &mut stop_rx, *SAFEPOINT_REFRESH_INTERVAL).await {
                return;
            }
        }
    }
}

/// Sleep for `duration` unless the stop signal fires first. Returns false
/// when the caller should exit.
pub(crate) async fn wait_or_stop<RT: Runtime>(
    rt: &RT,
    stop_rx: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    select_biased! {
        // A closed channel means the store handle is gone; stop either way.
        _ = stop_rx.changed().fuse() => false,
        _ = rt.wait(duration) => true,
    }
}

pub(crate) async fn load_safepoint(session: &dyn ConfigSession) -> anyhow::Result<u64> {
    let value = session.get(SAFEPOINT_CONFIG_KEY).await?;
    match value {
        // A cluster that has never run GC has no safepoint yet.
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("malformed persisted safepoint {raw:?}: {e}")),
    }
}

pub(crate) async fn save_safepoint(session: &dyn ConfigSession, value: u64) -> anyhow::Result<()> {
    session.put(SAFEPOINT_CONFIG_KEY, &value.to_string()).await
}
