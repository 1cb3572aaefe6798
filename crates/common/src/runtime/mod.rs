//! Runtime trait for abstracting away OS-esque features and allow different
//! implementations for test, dev, prod, etc.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
    TryFutureExt,
};
use rand::Rng;
use thiserror::Error;
pub use tokio::time::Instant;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e}"))
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn into_join_future(self: Box<Self>) -> BoxFuture<'static, Result<(), JoinError>>;
}

/// Handle for a future running on a tokio executor. Used by both the prod and
/// test runtimes since they share tokio's scheduler.
pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl FutureHandle {
    pub fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self: Box<Self>) -> BoxFuture<'static, Result<(), JoinError>> {
        self.handle.map_err(JoinError::from).boxed()
    }
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.into_join_future().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// A Runtime can be considered somewhat like an operating system abstraction
/// for our codebase. Functionality like time, sleeping, and randomness should
/// operate differently between test and prod: in test we don't want `wait` to
/// actually put the thread to sleep but instead just advance a virtual clock.
/// Application code that needs any of this is parameterized by a runtime
/// implementation.
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Source of randomness associated with the runtime.
    type Rng: Rng;

    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Return (a potentially-virtualized) system time.
    fn system_time(&self) -> SystemTime;

    /// Return (a potentially-virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> Instant;

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R;
}
