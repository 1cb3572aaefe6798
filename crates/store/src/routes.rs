//! Cache of key-range routes resolved from the placement service.
//!
//! Routes are versioned by the placement service; a split or merge bumps the
//! version. The cache only replaces an entry with a strictly newer version,
//! so a slow resolution finishing after a newer route landed can't regress
//! the cache.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use anyhow::Context;
use parking_lot::RwLock;

use crate::{
    clients::PlacementClient,
    metrics,
};

/// Network address of one storage replica.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaAddr(pub String);

impl fmt::Display for ReplicaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteVersion(pub u64);

/// One key range and the replicas serving it. `end` is exclusive; an empty
/// `end` means the range is unbounded above.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRoute {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub replicas: Vec<ReplicaAddr>,
    pub leader: usize,
    pub version: RouteVersion,
}

impl RegionRoute {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= &self.start[..] && (self.end.is_empty() || key < &self.end[..])
    }

    pub fn leader_addr(&self) -> anyhow::Result<&ReplicaAddr> {
        self.replicas
            .get(self.leader)
            .with_context(|| format!("route for {:?} has no leader replica", self.start))
    }

    fn overlaps(&self, other: &RegionRoute) -> bool {
        let self_below = !self.end.is_empty() && self.end <= other.start;
        let other_below = !other.end.is_empty() && other.end <= self.start;
        !self_below && !other_below
    }
}

pub struct RouteCache {
    placement: Arc<dyn PlacementClient>,
    routes: RwLock<BTreeMap<Vec<u8>, RegionRoute>>,
}

impl RouteCache {
    pub fn new(placement: Arc<dyn PlacementClient>) -> Self {
        Self {
            placement,
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Return the cached or freshly resolved route covering `key`. The
    /// placement call happens outside the cache lock.
    pub async fn route_for_key(&self, key: &[u8]) -> anyhow::Result<RegionRoute> {
        if let Some(route) = self.cached_route(key) {
            metrics::log_route_cache_hit();
            return Ok(route);
        }
        metrics::log_route_cache_miss();
        let route = self.placement.resolve_route(key).await?;
        anyhow::ensure!(
            route.contains(key),
            "placement returned route [{:?}, {:?}) not covering key {:?}",
            route.start,
            route.end,
            key,
        );
        self.insert(route.clone());
        Ok(route)
    }

    pub fn cached_route(&self, key: &[u8]) -> Option<RegionRoute> {
        let routes = self.routes.read();
        let (_, route) = routes.range(..=key.to_vec()).next_back()?;
        route.contains(key).then(|| route.clone())
    }

    /// Install a route, evicting the overlapping entries it supersedes. A
    /// route is dropped on the floor if any overlapping cached entry carries
    /// an equal or newer version, so a slow resolution can neither overwrite
    /// nor evict a route installed after it started.
    pub fn insert(&self, route: RegionRoute) {
        let mut routes = self.routes.write();
        let mut superseded = Vec::new();
        for existing in routes.values() {
            if !existing.overlaps(&route) {
                continue;
            }
            if existing.version >= route.version {
                return;
            }
            superseded.push(existing.start.clone());
        }
        for start in superseded {
            routes.remove(&start);
        }
        routes.insert(route.start.clone(), route);
    }

    /// Drop a route observed to be stale. A newer cached route for the same
    /// start key is left alone.
    pub fn invalidate(&self, route: &RegionRoute) {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(&route.start) {
            if existing.version <= route.version {
                routes.remove(&route.start);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
