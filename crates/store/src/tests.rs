use std::{
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    knobs::{
        GC_RUN_INTERVAL,
        SAFEPOINT_REFRESH_INTERVAL,
        SAFEPOINT_STALENESS_THRESHOLD,
    },
    runtime::{
        testing::TestRuntime,
        Runtime,
    },
    types::{
        ClusterId,
        TxnTimestamp,
    },
};
use errors::ErrorMetadataAnyhowExt;

use tokio::sync::{
    Barrier,
    Semaphore,
};

use crate::{
    clients::{
        ClusterClientFactory,
        ClusterClients,
        KvClient,
        KvRequest,
        KvResponse,
        PlacementClient,
        ResponseStatus,
    },
    descriptor::ConnectionSpec,
    routes::{
        RegionRoute,
        ReplicaAddr,
        RouteVersion,
    },
    safepoint::SafepointTracker,
    testing::{
        FlakyOracle,
        FlakyPlacement,
        MockClusterFactory,
        MockConfig,
        MockKvStore,
        MockOracle,
        MockPlacement,
        TEST_DESCRIPTOR,
    },
    StoreRegistry,
};

/// Let background workers observe an advanced clock.
async fn settle(rt: &TestRuntime, duration: Duration) {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    rt.advance_time(duration).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

struct UnreachableCluster;

#[async_trait]
impl ClusterClientFactory for UnreachableCluster {
    async fn connect(&self, _spec: &ConnectionSpec) -> anyhow::Result<ClusterClients> {
        anyhow::bail!("connection refused")
    }
}

/// KV client counting `close` calls, so a handle's teardown is observable.
struct TrackedKv {
    inner: Arc<MockKvStore>,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl KvClient for TrackedKv {
    async fn send(
        &self,
        replica: &ReplicaAddr,
        request: &KvRequest,
        timeout: Duration,
    ) -> anyhow::Result<KvResponse> {
        self.inner.send(replica, request, timeout).await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}

/// Holds identity resolution until the expected number of opens have all
/// reached it, forcing the opens to race past the registry's fast path.
struct RendezvousPlacement {
    inner: Arc<MockPlacement>,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl PlacementClient for RendezvousPlacement {
    async fn get_cluster_identity(&self) -> anyhow::Result<ClusterId> {
        self.barrier.wait().await;
        self.inner.get_cluster_identity().await
    }

    async fn resolve_route(&self, key: &[u8]) -> anyhow::Result<RegionRoute> {
        self.inner.resolve_route(key).await
    }

    async fn close(&self) {}
}

/// Hands out fresh clients per connect, so each open's teardown is counted
/// separately.
struct RacingClusterFactory {
    placement: Arc<MockPlacement>,
    barrier: Arc<Barrier>,
    kv_closes: Arc<AtomicU32>,
}

#[async_trait]
impl ClusterClientFactory for RacingClusterFactory {
    async fn connect(&self, _spec: &ConnectionSpec) -> anyhow::Result<ClusterClients> {
        Ok(ClusterClients {
            placement: Arc::new(RendezvousPlacement {
                inner: self.placement.clone(),
                barrier: self.barrier.clone(),
            }),
            oracle: Arc::new(MockOracle::new()),
            kv: Arc::new(TrackedKv {
                inner: Arc::new(MockKvStore::new()),
                closes: self.kv_closes.clone(),
            }),
            config: Arc::new(MockConfig::new()),
        })
    }
}

/// Blocks request execution until the test releases the gate.
struct GatedKv {
    inner: Arc<MockKvStore>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl KvClient for GatedKv {
    async fn send(
        &self,
        replica: &ReplicaAddr,
        request: &KvRequest,
        timeout: Duration,
    ) -> anyhow::Result<KvResponse> {
        let _permit = self.gate.acquire().await?;
        self.inner.send(replica, request, timeout).await
    }

    async fn close(&self) {}
}

#[tokio::test(start_paused = true)]
async fn test_open_deduplicates_by_cluster_identity() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let factory = MockClusterFactory::new();
    let store1 = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    let store2 = registry
        .open(rt.clone(), "meridian://other-endpoint:2379", &factory)
        .await?;
    // Same identity behind both descriptors, so the handle is shared.
    assert!(Arc::ptr_eq(&store1, &store2));
    assert_eq!(registry.len(), 1);

    let other = MockClusterFactory::with_cluster_id(ClusterId(2));
    let store3 = registry.open(rt.clone(), TEST_DESCRIPTOR, &other).await?;
    assert!(!Arc::ptr_eq(&store1, &store3));
    assert_eq!(registry.len(), 2);

    store1.close().await?;
    store3.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_deregisters_and_is_idempotent() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let factory = MockClusterFactory::new();
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    assert_eq!(registry.len(), 1);
    store.close().await?;
    store.close().await?;
    assert!(registry.is_empty());

    // A fresh open after close constructs a new handle.
    let reopened = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    assert!(!Arc::ptr_eq(&store, &reopened));
    reopened.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_opens_share_one_handle() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let kv_closes = Arc::new(AtomicU32::new(0));
    let factory = Arc::new(RacingClusterFactory {
        placement: Arc::new(MockPlacement::single_range(ClusterId(1), "replica-1")),
        barrier: Arc::new(Barrier::new(2)),
        kv_closes: kv_closes.clone(),
    });
    // Both opens connect and resolve identity before either registers, so
    // one of them must lose and tear its half-built clients down.
    let first = {
        let (rt, registry, factory) = (rt.clone(), registry.clone(), factory.clone());
        tokio::spawn(async move { registry.open(rt, TEST_DESCRIPTOR, &*factory).await })
    };
    let second = {
        let (rt, registry, factory) = (rt.clone(), registry.clone(), factory.clone());
        tokio::spawn(async move { registry.open(rt, TEST_DESCRIPTOR, &*factory).await })
    };
    let store1 = first.await??;
    let store2 = second.await??;
    assert!(Arc::ptr_eq(&store1, &store2));
    assert_eq!(registry.len(), 1);
    assert_eq!(kv_closes.load(Ordering::SeqCst), 1);

    store1.close().await?;
    assert!(registry.is_empty());
    assert_eq!(kv_closes.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_with_read_in_flight() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let kv = Arc::new(MockKvStore::new());
    kv.insert(b"k".to_vec(), b"v".to_vec());
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockClusterFactory::new().with_kv(Arc::new(GatedKv {
        inner: kv,
        gate: gate.clone(),
    }));
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    let snapshot = store.snapshot(store.current_version().await?)?;
    let read = tokio::spawn(async move { snapshot.get(b"k").await });
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    // The read is parked at the replica; closing must not disturb it.
    store.close().await?;
    assert!(registry.is_empty());
    gate.add_permits(1);
    assert_eq!(read.await??, Some(b"v".to_vec()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_open_error_taxonomy() {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let factory = MockClusterFactory::new();

    let err = registry
        .open(rt.clone(), "bogus://x", &factory)
        .await
        .unwrap_err();
    assert!(err.is_invalid_configuration(), "{err:?}");

    let err = registry
        .open(rt.clone(), TEST_DESCRIPTOR, &UnreachableCluster)
        .await
        .unwrap_err();
    assert!(err.is_cluster_unavailable(), "{err:?}");
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_open_recovers_by_caller_retry() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let placement = Arc::new(FlakyPlacement::new(
        Arc::new(MockPlacement::single_range(ClusterId(1), "replica-1")),
        1,
    ));
    let factory = MockClusterFactory::new().with_placement(placement);
    let err = registry
        .open(rt.clone(), TEST_DESCRIPTOR, &factory)
        .await
        .unwrap_err();
    assert!(err.is_cluster_unavailable(), "{err:?}");
    // Identity resolution failures are not retried internally; the caller
    // retries the whole open.
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_absorbs_transient_resolution_failures() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let placement = Arc::new(FlakyPlacement::new(
        Arc::new(MockPlacement::single_range(ClusterId(1), "replica-1")),
        0,
    ));
    let factory = MockClusterFactory::new().with_placement(placement.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    let snapshot = store.snapshot(store.current_version().await?)?;
    placement.fail_next(2);
    assert_eq!(snapshot.get(b"k").await?, None);

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timestamps_survive_transient_oracle_failures() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let factory = MockClusterFactory::new()
        .with_oracle(Arc::new(FlakyOracle::new(Arc::new(MockOracle::new()), 3)));
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    let ts1 = store.current_version().await?;
    let ts2 = store.current_version().await?;
    assert!(ts2 > ts1);
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timestamp_retry_exhaustion_surfaces_unavailable() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let factory = MockClusterFactory::new()
        .with_oracle(Arc::new(FlakyOracle::new(Arc::new(MockOracle::new()), u32::MAX)));
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    let err = store.current_version().await.unwrap_err();
    assert!(err.is_timestamp_unavailable(), "{err:?}");
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_safepoint_refresh_and_admission() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let config = Arc::new(MockConfig::new());
    config.set_safepoint(1000);
    let factory = MockClusterFactory::new().with_config(config.clone());
    let store = registry
        .open(
            rt.clone(),
            "meridian://placement-1:2379?disableGC=true",
            &factory,
        )
        .await?;
    settle(&rt, *SAFEPOINT_REFRESH_INTERVAL).await;
    assert_eq!(store.safepoint_tracker().current(), 1000);

    let err = store
        .begin_transaction_at(TxnTimestamp::from(1000))
        .await
        .unwrap_err();
    assert!(err.is_snapshot_below_safepoint(), "{err:?}");
    let txn = store.begin_transaction_at(TxnTimestamp::from(1001)).await?;
    assert_eq!(txn.start_timestamp(), TxnTimestamp::from(1001));

    // A regressed persisted value is ignored but still counts as a refresh.
    config.set_safepoint(400);
    settle(&rt, *SAFEPOINT_REFRESH_INTERVAL).await;
    assert_eq!(store.safepoint_tracker().current(), 1000);

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_loop_survives_config_failures() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let config = Arc::new(MockConfig::new());
    config.set_safepoint(77);
    config.fail_sessions(2);
    config.fail_gets(2);
    let factory = MockClusterFactory::new().with_config(config.clone());
    let store = registry
        .open(
            rt.clone(),
            "meridian://placement-1:2379?disableGC=true",
            &factory,
        )
        .await?;
    // Each failure costs one refresh interval before the loop tries again.
    for _ in 0..6 {
        settle(&rt, *SAFEPOINT_REFRESH_INTERVAL).await;
    }
    assert_eq!(store.safepoint_tracker().current(), 77);
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_visibility_check_rejects_stale_state() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let tracker = SafepointTracker::new(rt.monotonic_now());
    assert_eq!(tracker.check_visibility()?, 0);
    rt.advance_time(*SAFEPOINT_STALENESS_THRESHOLD + Duration::from_secs(1))
        .await;
    let err = tracker.check_visibility().unwrap_err();
    assert!(err.is_possibly_stale_safepoint(), "{err:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gc_trigger_persists_candidates() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let config = Arc::new(MockConfig::new());
    let factory = MockClusterFactory::new().with_config(config.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;
    assert!(store.gc_enabled());
    settle(&rt, *GC_RUN_INTERVAL).await;
    let first = config.persisted_safepoint().expect("no candidate persisted");
    assert!(first > 0);
    settle(&rt, *GC_RUN_INTERVAL).await;
    let second = config.persisted_safepoint().expect("no candidate persisted");
    assert!(second > first);
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disable_gc_still_refreshes_safepoint() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let config = Arc::new(MockConfig::new());
    let factory = MockClusterFactory::new().with_config(config.clone());
    let store = registry
        .open(
            rt.clone(),
            "meridian://placement-1:2379?disableGC=true",
            &factory,
        )
        .await?;
    assert!(!store.gc_enabled());
    settle(&rt, *GC_RUN_INTERVAL).await;
    // No candidate was persisted, but the refresh loop is alive.
    assert_eq!(config.persisted_safepoint(), None);
    config.set_safepoint(12);
    settle(&rt, *SAFEPOINT_REFRESH_INTERVAL).await;
    assert_eq!(store.safepoint_tracker().current(), 12);
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transaction_read_write_commit() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let kv = Arc::new(MockKvStore::new());
    kv.insert(b"present".to_vec(), b"old".to_vec());
    let factory = MockClusterFactory::new().with_kv(kv.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    let mut txn = store.begin_transaction().await?;
    assert_eq!(txn.get(b"present").await?, Some(b"old".to_vec()));
    assert_eq!(txn.get(b"missing").await?, None);
    txn.put(b"k1".to_vec(), b"v1".to_vec());
    txn.delete(b"present".to_vec());
    // Reads observe the local buffer before the snapshot.
    assert_eq!(txn.get(b"k1").await?, Some(b"v1".to_vec()));
    assert_eq!(txn.get(b"present").await?, None);
    let start_ts = txn.start_timestamp();
    let commit_ts = txn.commit().await?;
    assert!(commit_ts > start_ts);

    let snapshot = store.snapshot(commit_ts)?;
    assert_eq!(snapshot.get(b"k1").await?, Some(b"v1".to_vec()));
    assert_eq!(snapshot.get(b"present").await?, None);

    // A read-only transaction commits at its start timestamp.
    let txn = store.begin_transaction().await?;
    let start_ts = txn.start_timestamp();
    assert_eq!(txn.commit().await?, start_ts);

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_route_invalidates_only_affected_range() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let placement = Arc::new(MockPlacement::new(ClusterId(1)));
    let route = |start: &[u8], end: &[u8], replica: &str| RegionRoute {
        start: start.to_vec(),
        end: end.to_vec(),
        replicas: vec![ReplicaAddr(replica.to_string())],
        leader: 0,
        version: RouteVersion(1),
    };
    placement.set_routes(vec![route(b"", b"m", "replica-1"), route(b"m", b"", "replica-2")]);
    let kv = Arc::new(MockKvStore::new());
    let factory = MockClusterFactory::new()
        .with_placement(placement.clone())
        .with_kv(kv.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    // Warm both routes.
    let snapshot = store.snapshot(store.current_version().await?)?;
    snapshot.get(b"a").await?;
    snapshot.get(b"z").await?;
    let resolutions = placement.resolutions();
    assert_eq!(store.route_cache().len(), 2);

    kv.enqueue_status(ResponseStatus::StaleRoute("leadership changed".to_string()));
    snapshot.get(b"a").await?;
    // The affected route was re-resolved; the other stayed cached.
    assert_eq!(placement.resolutions(), resolutions + 1);
    assert!(store.route_cache().cached_route(b"z").is_some());

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_busy_retries_without_invalidating() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let kv = Arc::new(MockKvStore::new());
    let placement = Arc::new(MockPlacement::single_range(ClusterId(1), "replica-1"));
    let factory = MockClusterFactory::new()
        .with_placement(placement.clone())
        .with_kv(kv.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    let snapshot = store.snapshot(store.current_version().await?)?;
    snapshot.get(b"k").await?;
    assert_eq!(placement.resolutions(), 1);
    kv.enqueue_status(ResponseStatus::ServerBusy("compacting".to_string()));
    kv.enqueue_status(ResponseStatus::ServerBusy("compacting".to_string()));
    snapshot.get(b"k").await?;
    // The route never left the cache, so no re-resolution happened.
    assert_eq!(placement.resolutions(), 1);

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fatal_response_fails_fast() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let kv = Arc::new(MockKvStore::new());
    let factory = MockClusterFactory::new().with_kv(kv.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    let snapshot = store.snapshot(store.current_version().await?)?;
    let before = kv.requests();
    kv.enqueue_status(ResponseStatus::Fatal("malformed request".to_string()));
    let err = snapshot.get(b"k").await.unwrap_err();
    assert!(err.is_bad_request(), "{err:?}");
    // No retries were spent on a permanent rejection.
    assert_eq!(kv.requests(), before + 1);

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_leaderless_route_surfaces_route_resolution_failed() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let placement = Arc::new(MockPlacement::new(ClusterId(1)));
    // Placement keeps advertising a route with no resolvable leader.
    placement.set_routes(vec![RegionRoute {
        start: Vec::new(),
        end: Vec::new(),
        replicas: Vec::new(),
        leader: 0,
        version: RouteVersion(1),
    }]);
    let factory = MockClusterFactory::new().with_placement(placement);
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    let snapshot = store.snapshot(store.current_version().await?)?;
    let err = snapshot.get(b"k").await.unwrap_err();
    assert!(err.is_route_resolution_failed(), "{err:?}");

    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_exhaustion_surfaces_route_resolution_failed() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let registry = StoreRegistry::new();
    let kv = Arc::new(MockKvStore::new());
    let factory = MockClusterFactory::new().with_kv(kv.clone());
    let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

    let snapshot = store.snapshot(store.current_version().await?)?;
    for _ in 0..=*common::knobs::STALE_ROUTE_RETRY_LIMIT {
        kv.enqueue_status(ResponseStatus::StaleRoute("moved".to_string()));
    }
    let err = snapshot.get(b"k").await.unwrap_err();
    assert!(err.is_route_resolution_failed(), "{err:?}");

    store.close().await?;
    Ok(())
}
