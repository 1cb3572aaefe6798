//! Process-wide registry of cluster store handles.
//!
//! At most one [`ClusterStore`] exists per cluster identity per registry.
//! Opening a descriptor resolves the cluster's identity first, outside the
//! registry lock, then inserts under the lock. Two concurrent opens of a
//! brand-new cluster may both connect and resolve; exactly one wins the
//! insert and the loser tears its half-built handle down and returns the
//! winner's.

use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    runtime::Runtime,
    types::ClusterId,
};
use parking_lot::Mutex;

use crate::{
    clients::ClusterClientFactory,
    descriptor::ConnectionSpec,
    metrics,
    ClusterStore,
};

pub struct StoreRegistry<RT: Runtime> {
    stores: Arc<Mutex<HashMap<ClusterId, Arc<ClusterStore<RT>>>>>,
}

impl<RT: Runtime> Clone for StoreRegistry<RT> {
    fn clone(&self) -> Self {
        Self {
            stores: self.stores.clone(),
        }
    }
}

impl<RT: Runtime> StoreRegistry<RT> {
    pub fn new() -> Self {
        Self {
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a store for `descriptor`, reusing the existing handle if this
    /// registry already has one for the same cluster identity.
    pub async fn open(
        &self,
        rt: RT,
        descriptor: &str,
        factory: &dyn ClusterClientFactory,
    ) -> anyhow::Result<Arc<ClusterStore<RT>>> {
        let spec = ConnectionSpec::parse(descriptor)?;
        let clients = factory.connect(&spec).await.map_err(|e| {
            e.context(errors::ErrorMetadata::cluster_unavailable(format!(
                "failed to connect to cluster at {:?}",
                spec.placement_addrs,
            )))
        })?;
        let cluster_id = match clients.placement.get_cluster_identity().await {
            Ok(cluster_id) => cluster_id,
            Err(e) => {
                clients.close().await;
                return Err(e.context(errors::ErrorMetadata::cluster_unavailable(format!(
                    "failed to resolve cluster identity at {:?}",
                    spec.placement_addrs,
                ))));
            },
        };
        if let Some(existing) = self.get(cluster_id) {
            clients.close().await;
            metrics::log_store_opened(true);
            return Ok(existing);
        }
        // Construct outside the lock; identity resolution and client setup
        // are slow, and a concurrent open may win the insert below.
        let store = ClusterStore::new(rt, cluster_id, spec, clients, self.clone());
        let (winner, lost_race) = {
            let mut stores = self.stores.lock();
            match stores.get(&cluster_id) {
                Some(existing) => (existing.clone(), true),
                None => {
                    stores.insert(cluster_id, store.clone());
                    (store.clone(), false)
                },
            }
        };
        if lost_race {
            store.discard().await?;
            metrics::log_store_opened(true);
        } else {
            metrics::log_store_opened(false);
            tracing::info!("opened store for {cluster_id}");
        }
        Ok(winner)
    }

    pub fn get(&self, cluster_id: ClusterId) -> Option<Arc<ClusterStore<RT>>> {
        self.stores.lock().get(&cluster_id).cloned()
    }

    /// Remove `store` from the registry if it is still the registered handle
    /// for its cluster. A handle re-opened after a close must not be evicted
    /// by the old handle's teardown.
    pub(crate) fn remove(&self, store: &Arc<ClusterStore<RT>>) {
        let mut stores = self.stores.lock();
        if let Some(existing) = stores.get(&store.cluster_id()) {
            if Arc::ptr_eq(existing, store) {
                stores.remove(&store.cluster_id());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }
}

impl<RT: Runtime> Default for StoreRegistry<RT> {
    fn default() -> Self {
        Self::new()
    }
}
