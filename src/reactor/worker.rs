//! Callback worker pool.
//!
//! Application callbacks may block (blocking reads, slow handlers), so they
//! run on tokio's blocking pool of a dedicated multi-threaded runtime rather
//! than on a dispatcher thread. The runtime's async workers drive the
//! timeout watchdogs.

use crate::config::{CallbackMode, IoConfig};
use crate::error::Result;
use std::fmt;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(config: &IoConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.max_worker_threads.max(1))
            .thread_name("flashio-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        debug!(
            workers = config.worker_threads,
            max_workers = config.max_worker_threads,
            "Worker pool started"
        );
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs a blocking job on the pool.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(job);
    }

    /// The executor connections use for their callbacks.
    pub fn executor(&self, mode: CallbackMode) -> Executor {
        match mode {
            CallbackMode::Inline => Executor::Inline,
            CallbackMode::WorkerPool => Executor::Pool(self.handle.clone()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

/// Runs callback batches either on the calling thread or on the pool.
#[derive(Debug, Clone)]
pub enum Executor {
    Inline,
    Pool(Handle),
}

impl Executor {
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Executor::Inline => job(),
            Executor::Pool(handle) => {
                handle.spawn_blocking(job);
            }
        }
    }
}
