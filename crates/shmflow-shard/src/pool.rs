//! Worker threads: one distributor plus `handler_count` handlers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use shmflow_accum::Accumulator;
use shmflow_error::{Result, ShmflowError};
use shmflow_types::Cx;
use tracing::{info, warn};

use crate::config::ShardConfig;
use crate::distributor::Distributor;
use crate::handler::{Handler, HandlerHandle};
use crate::sink::StreamSink;

/// Running shard threads. Dropping the pool cancels and joins them.
pub struct ShardPool {
    cx: Cx,
    handles: Vec<HandlerHandle>,
    workers: Vec<(String, JoinHandle<Result<()>>)>,
}

impl std::fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool")
            .field("handlers", &self.handles.len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl ShardPool {
    /// Spawn the handler threads and the distributor thread.
    pub fn spawn(
        accum: Arc<Accumulator>,
        sink: Arc<dyn StreamSink>,
        config: ShardConfig,
    ) -> Result<Self> {
        config.validate()?;
        config.check_writer_timeout(accum.config())?;
        let cx = Cx::new();
        let mut pool = Self {
            cx: cx.clone(),
            handles: Vec::with_capacity(config.handler_count),
            workers: Vec::with_capacity(config.handler_count + 1),
        };

        for id in 0..config.handler_count {
            let handler = Handler::new(id, Arc::clone(&accum), Arc::clone(&sink), &config);
            pool.handles.push(handler.handle());
            let worker_cx = cx.clone();
            pool.spawn_worker(format!("shmflow-handler-{id}"), move || {
                handler.run(&worker_cx)
            })?;
        }

        let mut distributor = Distributor::new(accum, pool.handles.clone(), config)?;
        pool.spawn_worker("shmflow-distributor".to_owned(), move || {
            distributor.run(&cx)
        })?;

        info!(handlers = pool.handles.len(), "shard pool started");
        Ok(pool)
    }

    fn spawn_worker(
        &mut self,
        name: String,
        body: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|err| ShmflowError::Worker(format!("failed to spawn {name}: {err}")));
        match handle {
            Ok(handle) => {
                self.workers.push((name, handle));
                Ok(())
            }
            Err(err) => {
                // Already-started workers are stopped by Drop.
                self.cx.cancel();
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn handlers(&self) -> &[HandlerHandle] {
        &self.handles
    }

    /// Cancellation context shared by every worker.
    #[must_use]
    pub const fn cx(&self) -> &Cx {
        &self.cx
    }

    /// Cancel every worker and wait for it to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.join_all()
    }

    fn join_all(&mut self) -> Result<()> {
        self.cx.cancel();
        let mut first_err = None;
        for (name, worker) in self.workers.drain(..) {
            let outcome = worker
                .join()
                .map_err(|_| ShmflowError::Worker(format!("{name} panicked")))
                .and_then(|result| result);
            if let Err(err) = outcome {
                warn!(worker = %name, error = %err, "worker exited with error");
                first_err.get_or_insert(err);
            }
        }
        info!("shard pool stopped");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.join_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use shmflow_accum::StoreConfig;

    #[test]
    fn test_spawn_and_shutdown() {
        let accum = Arc::new(
            Accumulator::in_memory(StoreConfig {
                block_capacity: 256,
                max_blocks: 16,
                ..StoreConfig::default()
            })
            .unwrap(),
        );
        let config = ShardConfig {
            handler_count: 3,
            ..ShardConfig::default()
        };
        let pool = ShardPool::spawn(accum, Arc::new(CollectingSink::new()), config).unwrap();
        assert_eq!(pool.handlers().len(), 3);
        let cx = pool.cx().clone();
        pool.shutdown().unwrap();
        assert!(cx.is_cancel_requested());
    }

    #[test]
    fn test_invalid_config_spawns_nothing() {
        let accum = Arc::new(Accumulator::in_memory(StoreConfig::default()).unwrap());
        let config = ShardConfig {
            handler_count: 0,
            ..ShardConfig::default()
        };
        assert!(ShardPool::spawn(accum, Arc::new(CollectingSink::new()), config).is_err());
    }

    #[test]
    fn test_writer_outliving_handler_rejected() {
        let accum = Arc::new(
            Accumulator::in_memory(StoreConfig {
                block_capacity: 256,
                max_blocks: 16,
                writer_flow_timeout_us: 20_000_000,
                ..StoreConfig::default()
            })
            .unwrap(),
        );
        let err = ShardPool::spawn(accum, Arc::new(CollectingSink::new()), ShardConfig::default())
            .unwrap_err();
        assert!(matches!(err, ShmflowError::InvalidConfig { .. }));
    }
}
