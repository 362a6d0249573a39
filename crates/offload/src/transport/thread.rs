//! Thread backend: each worker is a named OS thread inside the master process.
//!
//! The thread runs its own current-thread runtime, rebuilds a registry from
//! the recorded sources and then runs the worker loop over an in-memory
//! channel. It exits once the master drops the command sender.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{channel_pair, Spawner, WorkerChannel, WorkerSpec};
use crate::error::OffloadError;
use crate::registry::FunctionRegistry;
use crate::worker;

/// Spawns worker threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

#[async_trait]
impl Spawner for ThreadSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerChannel, OffloadError> {
        let (channel, mut link) = channel_pair();
        let WorkerSpec { id, sources, debug } = spec;

        std::thread::Builder::new()
            .name(format!("offload-worker-{id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker_id = id, error = %e, "failed to build worker runtime");
                        return;
                    }
                };

                let registry = Arc::new(FunctionRegistry::from_sources(&sources, debug));
                if let Err(e) = runtime.block_on(worker::serve(id, registry, &mut link)) {
                    warn!(worker_id = id, error = %e, "worker loop ended with error");
                }
            })?;

        Ok(channel)
    }
}
