//! Scoped execution context.
//!
//! An [`ExecutionContext`] owns a dedicated `rayon` worker pool, the stage
//! graph of the run, and the validated configuration. It is acquired once at
//! pipeline start and released when the last handle is dropped;
//! [`ExecutionContext::scope`] ties that release to the end of a closure so it
//! happens on every exit path, successful or not.

use crate::config::EngineConfig;
use crate::error::{EnrichError, Result};
use crate::pipeline::Pipeline;
use std::sync::Arc;

struct ContextInner {
    pool: rayon::ThreadPool,
    pipeline: Pipeline,
    config: EngineConfig,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        log::debug!(
            "releasing execution context ({} threads, {} stages)",
            self.pool.current_num_threads(),
            self.pipeline.len()
        );
    }
}

/// Handle to a running execution context. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Validate `config` and build a worker pool for it.
    pub fn acquire(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let threads = config.threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("geobeam-worker-{i}"))
            .build()
            .map_err(|e| EnrichError::Config(format!("cannot build worker pool: {e}")))?;
        log::debug!(
            "acquired execution context ({threads} threads, {} partitions)",
            config.partitions
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                pool,
                pipeline: Pipeline::default(),
                config: config.clone(),
            }),
        })
    }

    /// Run `f` inside a freshly acquired context and release it afterwards,
    /// whether `f` succeeds or fails.
    pub fn scope<R>(
        config: &EngineConfig,
        f: impl FnOnce(&ExecutionContext) -> Result<R>,
    ) -> Result<R> {
        let ctx = Self::acquire(config)?;
        let out = f(&ctx);
        drop(ctx);
        out
    }

    /// Run `f` on this context's worker pool.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.inner.pool.install(f)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Default partition count for new datasets.
    pub fn partitions(&self) -> usize {
        self.inner.config.partitions
    }

    pub fn threads(&self) -> usize {
        self.inner.pool.current_num_threads()
    }
}
