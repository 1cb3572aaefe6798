//! Garbage collection trigger.
//!
//! When GC is enabled for a store, this loop periodically picks a new
//! safepoint candidate (current cluster time minus the configured lifetime)
//! and persists it to the configuration store, where the replicas' collectors
//! and every store's safepoint refresh loop pick it up. Disabled with the
//! `disableGC` descriptor option; the refresh loop in
//! [`crate::safepoint`] runs either way so visibility checks stay meaningful.

use std::sync::Arc;

use common::{
    knobs::{
        GC_LIFETIME,
        GC_RUN_INTERVAL,
    },
    runtime::Runtime,
    types::TxnTimestamp,
};
use tokio::sync::watch;

use crate::{
    clients::{
        ConfigSession,
        PersistedConfig,
        TimestampClient,
    },
    metrics,
    safepoint::{
        save_safepoint,
        wait_or_stop,
    },
};

pub(crate) async fn go_trigger_gc<RT: Runtime>(
    rt: RT,
    oracle: Arc<dyn TimestampClient>,
    config: Arc<dyn PersistedConfig>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut session: Option<Box<dyn ConfigSession>> = None;
    loop {
        if *stop_rx.borrow() {
            return;
        }
        match run_once(oracle.as_ref(), &config, &mut session).await {
            Ok(candidate) => {
                metrics::log_gc_trigger(true);
                tracing::trace!("advanced safepoint candidate to {candidate}");
            },
            Err(e) => {
                metrics::log_gc_trigger(false);
                // The session may be the broken half; rebuild it next round.
                session = None;
                let mut e = e.context("failed to advance safepoint candidate");
                common::errors::report_error(&mut e);
            },
        }
        if !wait_or_stop(&rt, &mut stop_rx, *GC_RUN_INTERVAL).await {
            return;
        }
    }
}

async fn run_once(
    oracle: &dyn TimestampClient,
    config: &Arc<dyn PersistedConfig>,
    session: &mut Option<Box<dyn ConfigSession>>,
) -> anyhow::Result<u64> {
    if session.is_none() {
        *session = Some(config.session().await?);
    }
    let session = session.as_deref().ok_or_else(|| anyhow::anyhow!("no config session"))?;
    let now = oracle.get_timestamp().await?;
    let candidate: TxnTimestamp =
        now.saturating_sub_physical_ms(GC_LIFETIME.as_millis() as u64);
    save_safepoint(session, candidate.into()).await?;
    Ok(candidate.into())
}
