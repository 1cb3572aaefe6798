//! Test implementation of the Runtime trait.
//!
//! Built on tokio's paused clock: run tests under
//! `#[tokio::test(start_paused = true)]` and every `wait` resolves by
//! auto-advancing virtual time instead of sleeping, which keeps tests both
//! fast and deterministic. Randomness comes from a seeded ChaCha12 stream.

use std::{
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::FusedFuture,
    Future,
    FutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use tokio::time::Instant;

use super::{
    FutureHandle,
    Runtime,
    SpawnHandle,
};

const DEFAULT_SEED: u64 = 0;

// Virtual wall-clock origin; arbitrary but stable across runs.
const TEST_EPOCH: Duration = Duration::from_secs(1_620_000_000);

#[derive(Clone)]
pub struct TestRuntime {
    start: Instant,
    rng: Arc<Mutex<ChaCha12Rng>>,
}

impl TestRuntime {
    /// Must be called from within a tokio runtime, typically one with
    /// `start_paused = true`.
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        cmd_util::env::config_test();
        Self {
            start: Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
        }
    }

    /// Advance the paused clock, running any timers that become due.
    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

impl Runtime for TestRuntime {
    type Rng = ChaCha12Rng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(FutureHandle::new(tokio::spawn(f)))
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + TEST_EPOCH + (Instant::now() - self.start)
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut self.rng.lock())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TestRuntime;
    use crate::runtime::Runtime;

    #[tokio::test(start_paused = true)]
    async fn test_wait_advances_virtual_time() {
        let rt = TestRuntime::new();
        let before = rt.monotonic_now();
        rt.wait(Duration::from_secs(3600)).await;
        assert_eq!(rt.monotonic_now() - before, Duration::from_secs(3600));
    }
}
