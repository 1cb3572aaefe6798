use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use common::{
    knobs::{
        RUNTIME_STACK_SIZE,
        RUNTIME_WORKER_THREADS,
    },
    runtime::{
        FutureHandle,
        Instant,
        Runtime,
        SpawnHandle,
    },
};
use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::rngs::ThreadRng;
use tokio::runtime::{
    Builder,
    Handle as TokioRuntimeHandle,
    Runtime as TokioRuntime,
};

#[derive(Clone)]
pub struct ProdRuntime {
    handle: TokioRuntimeHandle,
}

impl ProdRuntime {
    /// Build the tokio runtime the process runs on. Call once from `main`;
    /// the returned runtime must outlive every [`ProdRuntime`] cloned from
    /// it.
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        let mut builder = Builder::new_multi_thread();
        if *RUNTIME_WORKER_THREADS > 0 {
            builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        let runtime = builder
            .thread_stack_size(*RUNTIME_STACK_SIZE)
            .enable_all()
            .build()?;
        Ok(runtime)
    }

    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            handle: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.handle.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    type Rng = ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(FutureHandle::new(self.handle.spawn(f)))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut rand::rng())
    }
}
