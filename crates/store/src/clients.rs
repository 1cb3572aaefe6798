//! Client traits for the services a cluster exposes.
//!
//! The store never talks to the network directly; it goes through these
//! traits so tests can substitute in-memory fakes and production can plug in
//! whatever transport the deployment uses.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::types::{
    ClusterId,
    TxnTimestamp,
};

use crate::{
    descriptor::ConnectionSpec,
    routes::{
        RegionRoute,
        ReplicaAddr,
    },
};

/// Client for the placement service: cluster identity and key routing.
#[async_trait]
pub trait PlacementClient: Send + Sync + 'static {
    async fn get_cluster_identity(&self) -> anyhow::Result<ClusterId>;

    /// Resolve the authoritative route for `key`. Always a fresh answer from
    /// the placement service; caching happens above this trait.
    async fn resolve_route(&self, key: &[u8]) -> anyhow::Result<RegionRoute>;

    async fn close(&self);
}

/// Client for the timestamp service. One call returns one globally unique,
/// monotonically increasing [`TxnTimestamp`].
#[async_trait]
pub trait TimestampClient: Send + Sync + 'static {
    async fn get_timestamp(&self) -> anyhow::Result<TxnTimestamp>;

    async fn close(&self);
}

/// Transport for requests to storage replicas.
///
/// `send` returning `Err` means the request may or may not have reached the
/// replica (timeout, connection reset). Replica-level outcomes that did round
/// trip come back as a [`ResponseStatus`] instead.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    async fn send(
        &self,
        replica: &ReplicaAddr,
        request: &KvRequest,
        timeout: Duration,
    ) -> anyhow::Result<KvResponse>;

    async fn close(&self);
}

/// Small shared configuration store (the same service backing placement in
/// most deployments). The safepoint coordinator and GC trigger read and write
/// through sessions created here.
#[async_trait]
pub trait PersistedConfig: Send + Sync + 'static {
    async fn session(&self) -> anyhow::Result<Box<dyn ConfigSession>>;
}

/// One logical connection to the configuration store. A failed call poisons
/// the session; callers drop it and open a new one.
#[async_trait]
pub trait ConfigSession: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// The full set of clients for one cluster, produced by a
/// [`ClusterClientFactory`] from a parsed descriptor.
#[derive(Clone)]
pub struct ClusterClients {
    pub placement: Arc<dyn PlacementClient>,
    pub oracle: Arc<dyn TimestampClient>,
    pub kv: Arc<dyn KvClient>,
    pub config: Arc<dyn PersistedConfig>,
}

impl ClusterClients {
    pub(crate) async fn close(&self) {
        self.oracle.close().await;
        self.placement.close().await;
        self.kv.close().await;
    }
}

#[async_trait]
pub trait ClusterClientFactory: Send + Sync + 'static {
    async fn connect(&self, spec: &ConnectionSpec) -> anyhow::Result<ClusterClients>;
}

/// A single request addressed to one key. The replica-side execution protocol
/// is opaque to this layer; we only carry enough structure to route and
/// classify the response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvRequest {
    key: Vec<u8>,
    pub body: RequestBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestBody {
    SnapshotGet {
        version: TxnTimestamp,
    },
    Prewrite {
        value: Option<Vec<u8>>,
        start_version: TxnTimestamp,
    },
    Commit {
        start_version: TxnTimestamp,
        commit_version: TxnTimestamp,
    },
}

impl KvRequest {
    pub fn snapshot_get(key: Vec<u8>, version: TxnTimestamp) -> Self {
        Self {
            key,
            body: RequestBody::SnapshotGet { version },
        }
    }

    pub fn prewrite(key: Vec<u8>, value: Option<Vec<u8>>, start_version: TxnTimestamp) -> Self {
        Self {
            key,
            body: RequestBody::Prewrite {
                value,
                start_version,
            },
        }
    }

    pub fn commit(key: Vec<u8>, start_version: TxnTimestamp, commit_version: TxnTimestamp) -> Self {
        Self {
            key,
            body: RequestBody::Commit {
                start_version,
                commit_version,
            },
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

#[derive(Clone, Debug)]
pub struct KvResponse {
    pub status: ResponseStatus,
    pub value: Option<Vec<u8>>,
}

impl KvResponse {
    pub fn ok(value: Option<Vec<u8>>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            value,
        }
    }

    pub fn status(status: ResponseStatus) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// Replica-level outcome of a request that did round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    /// The replica no longer serves this key range. The route that produced
    /// this request must be invalidated before retrying.
    StaleRoute(String),
    /// The replica is overloaded or mid-recovery. Retriable with backoff
    /// against the same route.
    ServerBusy(String),
    /// Another transaction holds a lock covering the key. Retriable with
    /// backoff; the lock holder will commit or roll back.
    LockConflict(String),
    /// The replica rejected the request permanently.
    Fatal(String),
}
