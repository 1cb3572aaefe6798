//! Request dispatch to data replicas.
//!
//! One `send` call resolves the owning route for the request's key, ships
//! the request to the route's leader replica, and classifies the outcome.
//! Stale-route signals invalidate exactly the affected cache entry before
//! re-resolving; transient replica conditions retry against the same route.
//! All retries for one call share the caller's [`RetryContext`], so the
//! operation's cumulative deadline holds across failure kinds.

use std::{
    sync::Arc,
    time::Duration,
};

use common::runtime::Runtime;
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};

use crate::{
    clients::{
        KvClient,
        KvRequest,
        KvResponse,
        ResponseStatus,
    },
    metrics,
    retry::{
        FailureKind,
        RetryContext,
    },
    routes::RouteCache,
};

pub struct RequestDispatcher {
    routes: Arc<RouteCache>,
    client: Arc<dyn KvClient>,
}

impl RequestDispatcher {
    pub fn new(routes: Arc<RouteCache>, client: Arc<dyn KvClient>) -> Self {
        Self { routes, client }
    }

    pub fn routes(&self) -> &Arc<RouteCache> {
        &self.routes
    }

    /// Dispatch `request` to the leader replica owning its key. Retry
    /// exhaustion surfaces as `RouteResolutionFailed`; a permanent replica
    /// rejection surfaces immediately as `BadRequest` without consuming any
    /// retry budget.
    pub async fn send<RT: Runtime>(
        &self,
        ctx: &mut RetryContext<RT>,
        request: &KvRequest,
        timeout: Duration,
    ) -> anyhow::Result<KvResponse> {
        self.try_send(ctx, request, timeout).await.map_err(|e| {
            e.map_error_metadata(|m| {
                if m.is_retry_exhausted() {
                    ErrorMetadata::route_resolution_failed(format!(
                        "request for key {:?} failed: {}",
                        request.key(),
                        m.msg,
                    ))
                } else {
                    m
                }
            })
        })
    }

    async fn try_send<RT: Runtime>(
        &self,
        ctx: &mut RetryContext<RT>,
        request: &KvRequest,
        timeout: Duration,
    ) -> anyhow::Result<KvResponse> {
        loop {
            let route = match self.routes.route_for_key(request.key()).await {
                Ok(route) => route,
                Err(e) => {
                    ctx.backoff(FailureKind::StaleRoute, e).await?;
                    continue;
                },
            };
            let leader = match route.leader_addr() {
                Ok(leader) => leader.clone(),
                Err(e) => {
                    // A route with no resolvable leader is as good as stale.
                    self.routes.invalidate(&route);
                    ctx.backoff(FailureKind::StaleRoute, e).await?;
                    continue;
                },
            };
            let response = match self.client.send(&leader, request, timeout).await {
                Ok(response) => response,
                Err(e) => {
                    // The request may never have arrived; we can't tell a
                    // dead leader from a slow one, so drop the route and
                    // re-resolve on the way back in.
                    self.routes.invalidate(&route);
                    ctx.backoff(FailureKind::RpcTimeout, e).await?;
                    continue;
                },
            };
            match response.status {
                ResponseStatus::Ok => {
                    metrics::log_dispatch_ok();
                    return Ok(response);
                },
                ResponseStatus::StaleRoute(reason) => {
                    self.routes.invalidate(&route);
                    let err = anyhow::anyhow!("stale route to {leader}: {reason}");
                    ctx.backoff(FailureKind::StaleRoute, err).await?;
                },
                ResponseStatus::ServerBusy(reason) => {
                    let err = anyhow::anyhow!("replica {leader} busy: {reason}");
                    ctx.backoff(FailureKind::ReplicaBusy, err).await?;
                },
                ResponseStatus::LockConflict(reason) => {
                    let err = anyhow::anyhow!("lock conflict at {leader}: {reason}");
                    ctx.backoff(FailureKind::LockConflict, err).await?;
                },
                ResponseStatus::Fatal(reason) => {
                    return Err(anyhow::anyhow!("replica {leader} rejected request").context(
                        ErrorMetadata::bad_request("RequestRejected", reason),
                    ));
                },
            }
        }
    }
}
