//! Client-side coordination layer for a distributed transactional KV store.
//!
//! A [`ClusterStore`] is the process-local handle to one backing cluster. It
//! owns clients to the cluster's timestamp, placement, and replica services,
//! a route cache, and the background safepoint machinery. Handles are
//! deduplicated per cluster identity through a [`StoreRegistry`].
//!
//! Consistency obligations of this layer:
//! - no two handles for the same cluster identity within one registry;
//! - timestamps are acquired from the cluster's timestamp service and never
//!   reused or derived locally;
//! - no read is admitted at a version the garbage collector may already have
//!   reclaimed (see [`safepoint`]).

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use common::{
    knobs::{
        DISPATCH_MAX_BACKOFF,
        KV_REQUEST_TIMEOUT,
        TIMESTAMP_MAX_BACKOFF,
    },
    runtime::{
        shutdown_and_join,
        Runtime,
        SpawnHandle,
    },
    types::{
        ClusterId,
        TxnTimestamp,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use parking_lot::Mutex;
use tokio::sync::watch;

pub mod clients;
pub mod descriptor;
pub mod dispatcher;
mod gc;
mod metrics;
pub mod registry;
pub mod retry;
pub mod routes;
pub mod safepoint;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
#[cfg(test)]
mod tests;

pub use crate::registry::StoreRegistry;
use crate::{
    clients::{
        ClusterClients,
        KvClient,
        KvRequest,
        PlacementClient,
        TimestampClient,
    },
    descriptor::ConnectionSpec,
    dispatcher::RequestDispatcher,
    retry::{
        FailureKind,
        RetryContext,
    },
    routes::RouteCache,
    safepoint::SafepointTracker,
};

pub struct ClusterStore<RT: Runtime> {
    rt: RT,
    cluster_id: ClusterId,
    spec: ConnectionSpec,
    registry: StoreRegistry<RT>,
    oracle: Arc<dyn TimestampClient>,
    placement: Arc<dyn PlacementClient>,
    kv: Arc<dyn KvClient>,
    dispatcher: RequestDispatcher,
    safepoint: Arc<SafepointTracker>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<Box<dyn SpawnHandle>>>,
    closed: AtomicBool,
}

impl<RT: Runtime> ClusterStore<RT> {
    pub(crate) fn new(
        rt: RT,
        cluster_id: ClusterId,
        spec: ConnectionSpec,
        clients: ClusterClients,
        registry: StoreRegistry<RT>,
    ) -> Arc<Self> {
        let routes = Arc::new(RouteCache::new(clients.placement.clone()));
        let dispatcher = RequestDispatcher::new(routes, clients.kv.clone());
        let safepoint = Arc::new(SafepointTracker::new(rt.monotonic_now()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = vec![rt.spawn(
            "safepoint_refresh",
            safepoint::go_refresh_safepoint(
                rt.clone(),
                clients.config.clone(),
                safepoint.clone(),
                stop_rx.clone(),
            ),
        )];
        if !spec.disable_gc {
            workers.push(rt.spawn(
                "gc_trigger",
                gc::go_trigger_gc(
                    rt.clone(),
                    clients.oracle.clone(),
                    clients.config.clone(),
                    stop_rx,
                ),
            ));
        }
        Arc::new(Self {
            rt,
            cluster_id,
            spec,
            registry,
            oracle: clients.oracle,
            placement: clients.placement,
            kv: clients.kv,
            dispatcher,
            safepoint,
            stop_tx,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn placement_addrs(&self) -> &[String] {
        &self.spec.placement_addrs
    }

    pub fn gc_enabled(&self) -> bool {
        !self.spec.disable_gc
    }

    /// Acquire a fresh timestamp without starting a transaction.
    pub async fn current_version(&self) -> anyhow::Result<TxnTimestamp> {
        let mut ctx = RetryContext::new(self.rt.clone(), *TIMESTAMP_MAX_BACKOFF);
        self.timestamp_with_retry(&mut ctx).await
    }

    /// Begin a read-write transaction at a freshly acquired timestamp.
    pub async fn begin_transaction(self: &Arc<Self>) -> anyhow::Result<Transaction<RT>> {
        let start_ts = self.current_version().await?;
        self.admit_start_timestamp(start_ts)?;
        metrics::log_transaction_begun();
        Ok(Transaction::new(self.clone(), start_ts))
    }

    /// Begin a transaction at a caller-supplied timestamp, for replaying or
    /// resuming work begun elsewhere. The timestamp must still be admissible
    /// against the safepoint.
    pub async fn begin_transaction_at(
        self: &Arc<Self>,
        start_ts: TxnTimestamp,
    ) -> anyhow::Result<Transaction<RT>> {
        self.admit_start_timestamp(start_ts)?;
        metrics::log_transaction_begun();
        Ok(Transaction::new(self.clone(), start_ts))
    }

    /// Create a read-only snapshot at `version`.
    pub fn snapshot(self: &Arc<Self>, version: TxnTimestamp) -> anyhow::Result<Snapshot<RT>> {
        self.admit_start_timestamp(version)?;
        metrics::log_snapshot_created();
        Ok(Snapshot {
            store: self.clone(),
            version,
        })
    }

    /// Tear the handle down: deregister, stop background workers, and close
    /// the cluster connections. Safe to call more than once; later calls are
    /// no-ops. In-flight operations on other clones of the handle complete
    /// or fail on their own.
    pub async fn close(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.registry.remove(self);
        self.teardown().await?;
        tracing::info!("closed store for {}", self.cluster_id);
        Ok(())
    }

    /// Teardown for a handle that lost the registry insert race and was
    /// never registered.
    pub(crate) async fn discard(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.teardown().await
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        // The signal is observed at the top of each worker iteration and
        // before every sleep, so shutdown is prompt even mid-backoff.
        let _ = self.stop_tx.send(true);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            shutdown_and_join(worker).await?;
        }
        self.oracle.close().await;
        self.placement.close().await;
        self.kv.close().await;
        Ok(())
    }

    fn admit_start_timestamp(&self, start_ts: TxnTimestamp) -> anyhow::Result<()> {
        let safepoint = self.safepoint.check_visibility()?;
        if u64::from(start_ts) <= safepoint {
            return Err(anyhow::anyhow!("start timestamp not admissible").context(
                ErrorMetadata::snapshot_below_safepoint(start_ts.into(), safepoint),
            ));
        }
        Ok(())
    }

    async fn timestamp_with_retry(
        &self,
        ctx: &mut RetryContext<RT>,
    ) -> anyhow::Result<TxnTimestamp> {
        loop {
            match self.oracle.get_timestamp().await {
                Ok(ts) => {
                    metrics::log_timestamp_acquired();
                    return Ok(ts);
                },
                Err(e) => {
                    ctx.backoff(FailureKind::ClockService, e).await.map_err(|e| {
                        e.map_error_metadata(|m| {
                            if m.is_retry_exhausted() {
                                ErrorMetadata::timestamp_unavailable(format!(
                                    "could not acquire a timestamp: {}",
                                    m.msg,
                                ))
                            } else {
                                m
                            }
                        })
                    })?;
                },
            }
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn safepoint_tracker(&self) -> &Arc<SafepointTracker> {
        &self.safepoint
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn route_cache(&self) -> &Arc<RouteCache> {
        self.dispatcher.routes()
    }
}

impl<RT: Runtime> fmt::Debug for ClusterStore<RT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterStore")
            .field("cluster_id", &self.cluster_id)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// A read-write transaction. Writes are buffered locally and submitted in
/// two phases on [`commit`](Self::commit); reads observe the local buffer
/// first, then the snapshot at the start timestamp.
pub struct Transaction<RT: Runtime> {
    store: Arc<ClusterStore<RT>>,
    start_ts: TxnTimestamp,
    // None marks a buffered delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<RT: Runtime> Transaction<RT> {
    fn new(store: Arc<ClusterStore<RT>>, start_ts: TxnTimestamp) -> Self {
        Self {
            store,
            start_ts,
            writes: BTreeMap::new(),
        }
    }

    pub fn start_timestamp(&self) -> TxnTimestamp {
        self.start_ts
    }

    pub async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        self.store
            .snapshot_read(key, self.start_ts)
            .await
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// Commit the buffered writes. Returns the commit timestamp, or the
    /// start timestamp for a read-only transaction.
    pub async fn commit(self) -> anyhow::Result<TxnTimestamp> {
        if self.writes.is_empty() {
            return Ok(self.start_ts);
        }
        let commit_ts = self.store.current_version().await?;
        anyhow::ensure!(
            commit_ts > self.start_ts,
            "commit timestamp {commit_ts} not after start timestamp {}",
            self.start_ts,
        );
        let mut ctx = RetryContext::new(self.store.rt.clone(), *DISPATCH_MAX_BACKOFF);
        for (key, value) in &self.writes {
            let request = KvRequest::prewrite(key.clone(), value.clone(), self.start_ts);
            self.store
                .dispatcher
                .send(&mut ctx, &request, *KV_REQUEST_TIMEOUT)
                .await?;
        }
        for key in self.writes.keys() {
            let request = KvRequest::commit(key.clone(), self.start_ts, commit_ts);
            self.store
                .dispatcher
                .send(&mut ctx, &request, *KV_REQUEST_TIMEOUT)
                .await?;
        }
        metrics::log_transaction_committed();
        Ok(commit_ts)
    }
}

impl<RT: Runtime> fmt::Debug for Transaction<RT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("start_ts", &self.start_ts)
            .field("buffered_writes", &self.writes.len())
            .finish_non_exhaustive()
    }
}

/// A read-only view of the store at one version.
pub struct Snapshot<RT: Runtime> {
    store: Arc<ClusterStore<RT>>,
    version: TxnTimestamp,
}

impl<RT: Runtime> Snapshot<RT> {
    pub fn version(&self) -> TxnTimestamp {
        self.version
    }

    pub async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.store.snapshot_read(key, self.version).await
    }
}

impl<RT: Runtime> ClusterStore<RT> {
    async fn snapshot_read(
        &self,
        key: &[u8],
        version: TxnTimestamp,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let mut ctx = RetryContext::new(self.rt.clone(), *DISPATCH_MAX_BACKOFF);
        let request = KvRequest::snapshot_get(key.to_vec(), version);
        let response = self
            .dispatcher
            .send(&mut ctx, &request, *KV_REQUEST_TIMEOUT)
            .await?;
        Ok(response.value)
    }
}
