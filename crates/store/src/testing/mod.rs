//! In-memory fakes for every cluster service the store consumes.
//!
//! The defaults behave like a healthy single-range cluster. Failure
//! injection is explicit: replica-level outcomes are scripted per request
//! with [`MockKvStore::enqueue_status`], and the flaky wrappers fail a fixed
//! number of calls before delegating to a healthy inner client.

use std::{
    collections::{
        BTreeMap,
        HashMap,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicU32,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::types::{
    ClusterId,
    TxnTimestamp,
};
use parking_lot::Mutex;

use crate::{
    clients::{
        ClusterClientFactory,
        ClusterClients,
        ConfigSession,
        KvClient,
        KvRequest,
        KvResponse,
        PersistedConfig,
        PlacementClient,
        RequestBody,
        ResponseStatus,
        TimestampClient,
    },
    descriptor::ConnectionSpec,
    routes::{
        RegionRoute,
        ReplicaAddr,
        RouteVersion,
    },
    safepoint::SAFEPOINT_CONFIG_KEY,
};

pub const TEST_DESCRIPTOR: &str = "meridian://placement-1:2379";

pub struct MockPlacement {
    cluster_id: ClusterId,
    routes: Mutex<Vec<RegionRoute>>,
    resolutions: AtomicU64,
}

impl MockPlacement {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            routes: Mutex::new(Vec::new()),
            resolutions: AtomicU64::new(0),
        }
    }

    /// A placement service advertising one unbounded range served by a
    /// single replica.
    pub fn single_range(cluster_id: ClusterId, replica: &str) -> Self {
        let placement = Self::new(cluster_id);
        placement.set_routes(vec![RegionRoute {
            start: Vec::new(),
            end: Vec::new(),
            replicas: vec![ReplicaAddr(replica.to_string())],
            leader: 0,
            version: RouteVersion(1),
        }]);
        placement
    }

    pub fn set_routes(&self, routes: Vec<RegionRoute>) {
        *self.routes.lock() = routes;
    }

    /// Number of `resolve_route` calls served.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlacementClient for MockPlacement {
    async fn get_cluster_identity(&self) -> anyhow::Result<ClusterId> {
        Ok(self.cluster_id)
    }

    async fn resolve_route(&self, key: &[u8]) -> anyhow::Result<RegionRoute> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .iter()
            .find(|route| route.contains(key))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no route for key {key:?}"))
    }

    async fn close(&self) {}
}

/// A healthy timestamp service handing out strictly increasing timestamps.
pub struct MockOracle {
    counter: AtomicU64,
}

impl MockOracle {
    // Physical epoch well past any GC lifetime so safepoint candidates are
    // nonzero.
    const BASE_PHYSICAL_MS: u64 = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimestampClient for MockOracle {
    async fn get_timestamp(&self) -> anyhow::Result<TxnTimestamp> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(TxnTimestamp::from_parts(Self::BASE_PHYSICAL_MS + n, 0))
    }

    async fn close(&self) {}
}

/// Wrapper failing the first `failures` timestamp calls.
pub struct FlakyOracle {
    inner: Arc<dyn TimestampClient>,
    failures: AtomicU32,
}

impl FlakyOracle {
    pub fn new(inner: Arc<dyn TimestampClient>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TimestampClient for FlakyOracle {
    async fn get_timestamp(&self) -> anyhow::Result<TxnTimestamp> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected timestamp service failure");
        }
        self.inner.get_timestamp().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Wrapper failing the first `failures` placement calls (identity and route
/// resolution alike).
pub struct FlakyPlacement {
    inner: Arc<dyn PlacementClient>,
    failures: AtomicU32,
}

impl FlakyPlacement {
    pub fn new(inner: Arc<dyn PlacementClient>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    /// Fail the next `n` placement calls.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PlacementClient for FlakyPlacement {
    async fn get_cluster_identity(&self) -> anyhow::Result<ClusterId> {
        if self.take_failure() {
            anyhow::bail!("injected placement failure");
        }
        self.inner.get_cluster_identity().await
    }

    async fn resolve_route(&self, key: &[u8]) -> anyhow::Result<RegionRoute> {
        if self.take_failure() {
            anyhow::bail!("injected placement failure");
        }
        self.inner.resolve_route(key).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// In-memory replica set behind the [`KvClient`] interface.
///
/// Writes follow the two phase request flow: prewrites stage into a side
/// table keyed by start version, and the matching commit applies them.
pub struct MockKvStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    staged: Mutex<HashMap<(Vec<u8>, TxnTimestamp), Option<Vec<u8>>>>,
    scripted: Mutex<VecDeque<ResponseStatus>>,
    requests: AtomicU64,
}

impl MockKvStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            staged: Mutex::new(HashMap::new()),
            scripted: Mutex::new(VecDeque::new()),
            requests: AtomicU64::new(0),
        }
    }

    /// Make the next request (in FIFO order) come back with `status`
    /// instead of executing.
    pub fn enqueue_status(&self, status: ResponseStatus) {
        self.scripted.lock().push_back(status);
    }

    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.data.lock().insert(key, value);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for MockKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvClient for MockKvStore {
    async fn send(
        &self,
        _replica: &ReplicaAddr,
        request: &KvRequest,
        _timeout: Duration,
    ) -> anyhow::Result<KvResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.scripted.lock().pop_front() {
            return Ok(KvResponse::status(status));
        }
        match &request.body {
            RequestBody::SnapshotGet { .. } => {
                Ok(KvResponse::ok(self.data.lock().get(request.key()).cloned()))
            },
            RequestBody::Prewrite {
                value,
                start_version,
            } => {
                self.staged
                    .lock()
                    .insert((request.key().to_vec(), *start_version), value.clone());
                Ok(KvResponse::ok(None))
            },
            RequestBody::Commit { start_version, .. } => {
                let staged = self
                    .staged
                    .lock()
                    .remove(&(request.key().to_vec(), *start_version));
                match staged {
                    Some(Some(value)) => {
                        self.data.lock().insert(request.key().to_vec(), value);
                        Ok(KvResponse::ok(None))
                    },
                    Some(None) => {
                        self.data.lock().remove(request.key());
                        Ok(KvResponse::ok(None))
                    },
                    None => Ok(KvResponse::status(ResponseStatus::Fatal(
                        "commit without matching prewrite".to_string(),
                    ))),
                }
            },
        }
    }

    async fn close(&self) {}
}

/// In-memory configuration store with counted failure injection for both
/// session establishment and reads.
pub struct MockConfig {
    values: Arc<Mutex<HashMap<String, String>>>,
    failing_sessions: AtomicU32,
    failing_gets: Arc<AtomicU32>,
}

impl MockConfig {
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(HashMap::new())),
            failing_sessions: AtomicU32::new(0),
            failing_gets: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_safepoint(&self, value: u64) {
        self.values
            .lock()
            .insert(SAFEPOINT_CONFIG_KEY.to_string(), value.to_string());
    }

    pub fn persisted_safepoint(&self) -> Option<u64> {
        self.values
            .lock()
            .get(SAFEPOINT_CONFIG_KEY)
            .and_then(|raw| raw.parse().ok())
    }

    /// Fail the next `n` session establishments.
    pub fn fail_sessions(&self, n: u32) {
        self.failing_sessions.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads across all sessions.
    pub fn fail_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistedConfig for MockConfig {
    async fn session(&self) -> anyhow::Result<Box<dyn ConfigSession>> {
        if self
            .failing_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected session failure");
        }
        Ok(Box::new(MockConfigSession {
            values: self.values.clone(),
            failing_gets: self.failing_gets.clone(),
        }))
    }
}

struct MockConfigSession {
    values: Arc<Mutex<HashMap<String, String>>>,
    failing_gets: Arc<AtomicU32>,
}

#[async_trait]
impl ConfigSession for MockConfigSession {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        if self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected config read failure");
        }
        Ok(self.values.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Factory handing out one fixed set of mock clients. Builder methods swap
/// individual services for failure-injecting variants before the store is
/// opened.
pub struct MockClusterFactory {
    clients: ClusterClients,
}

impl MockClusterFactory {
    pub fn new() -> Self {
        Self::with_cluster_id(ClusterId(1))
    }

    pub fn with_cluster_id(cluster_id: ClusterId) -> Self {
        Self {
            clients: ClusterClients {
                placement: Arc::new(MockPlacement::single_range(cluster_id, "replica-1")),
                oracle: Arc::new(MockOracle::new()),
                kv: Arc::new(MockKvStore::new()),
                config: Arc::new(MockConfig::new()),
            },
        }
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementClient>) -> Self {
        self.clients.placement = placement;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn TimestampClient>) -> Self {
        self.clients.oracle = oracle;
        self
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvClient>) -> Self {
        self.clients.kv = kv;
        self
    }

    pub fn with_config(mut self, config: Arc<dyn PersistedConfig>) -> Self {
        self.clients.config = config;
        self
    }
}

impl Default for MockClusterFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClientFactory for MockClusterFactory {
    async fn connect(&self, _spec: &ConnectionSpec) -> anyhow::Result<ClusterClients> {
        Ok(self.clients.clone())
    }
}
