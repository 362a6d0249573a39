//! Entry point shared by master and worker contexts.
//!
//! The same program text runs in both: it creates an [`Offload`], registers
//! its sources, then calls [`Offload::lock`]. On the master, `lock` starts
//! the pool and `run` dispatches calls. In a process worker, `lock` serves
//! calls over stdin/stdout until the master hangs up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{Backend, OffloadConfig};
use crate::dispatch::{Dispatcher, RunHandle};
use crate::error::OffloadError;
use crate::pool::{self, WorkerPool};
use crate::registry::{Declare, FunctionRegistry, Inert, Source};
use crate::role::{Role, SOURCES_ENV};
use crate::transport::{ProcessSpawner, Spawner, StdioLink, ThreadSpawner};
use crate::worker;

pub struct Offload {
    role: Role,
    config: OffloadConfig,
    spawner: Arc<dyn Spawner>,
    sources: Mutex<Vec<Source>>,
    registry: Mutex<FunctionRegistry>,
    dispatcher: OnceCell<Dispatcher>,
    served: AtomicBool,
}

impl Offload {
    /// Validate `config`, detect the role of this process and pick the backend.
    ///
    /// Fails before any worker exists if the configuration is unusable.
    pub fn create(config: OffloadConfig) -> Result<Self, OffloadError> {
        config.validate()?;
        let role = Role::detect()?;
        let spawner: Arc<dyn Spawner> = match config.backend {
            Backend::Process => Arc::new(ProcessSpawner::from_config(&config)?),
            Backend::Thread => Arc::new(ThreadSpawner),
        };
        Ok(Self::with_spawner(config, role, spawner))
    }

    /// Build with an explicit role and spawner.
    pub fn with_spawner(config: OffloadConfig, role: Role, spawner: Arc<dyn Spawner>) -> Self {
        if config.debug {
            debug!(?role, backend = %config.backend, workers = config.workers, "offload created");
        }
        Self {
            role,
            config,
            spawner,
            sources: Mutex::new(Vec::new()),
            registry: Mutex::new(FunctionRegistry::new()),
            dispatcher: OnceCell::new(),
            served: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role.is_master()
    }

    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Declare a source of operations.
    ///
    /// In a worker the declarations land in the local registry; on the master
    /// they are evaluated against an inert sink and only the source is
    /// recorded, so thread workers can replay it.
    ///
    /// Operations of a process worker must keep stdout clear: it carries the
    /// framed replies, and stray output there drops the worker from the pool.
    pub fn register(&self, name: impl Into<String>, declare: Declare) -> &Self {
        let source = Source::new(name, declare);

        if self.dispatcher.initialized() || self.served.load(Ordering::SeqCst) {
            warn!(source = %source.name, "source registered after lock, workers will not see it");
        }

        match self.role {
            Role::Master => source.load(&mut Inert, self.config.debug),
            Role::Worker { .. } => source.load(&mut *pool::lock(&self.registry), self.config.debug),
        }
        pool::lock(&self.sources).push(source);
        self
    }

    /// Bring the pool up.
    ///
    /// On the master this spawns every worker and waits for each to signal
    /// ready; later calls return the existing pool. Returns `true` on the
    /// master. In a process worker it serves calls until the master closes
    /// the channel, then returns `false`.
    pub async fn lock(&self) -> Result<bool, OffloadError> {
        match self.role {
            Role::Master => {
                self.dispatcher.get_or_try_init(|| self.start_pool()).await?;
                Ok(true)
            }
            Role::Worker { id } => {
                if self.served.swap(true, Ordering::SeqCst) {
                    return Ok(false);
                }
                self.serve(id).await?;
                Ok(false)
            }
        }
    }

    async fn start_pool(&self) -> Result<Dispatcher, OffloadError> {
        let sources = pool::lock(&self.sources).clone();
        info!(
            backend = %self.config.backend,
            workers = self.config.workers,
            sources = sources.len(),
            "starting worker pool"
        );
        let (pool, inboxes) =
            WorkerPool::initialize(&self.config, self.spawner.as_ref(), &sources).await?;
        Ok(Dispatcher::new(
            pool,
            inboxes,
            self.config.call_timeout(),
            self.config.debug,
        ))
    }

    async fn serve(&self, id: usize) -> Result<(), OffloadError> {
        let loaded: Vec<String> = pool::lock(&self.sources)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        if let Ok(expected) = std::env::var(SOURCES_ENV) {
            if expected != loaded.join(",") {
                warn!(worker_id = id, %expected, loaded = %loaded.join(","), "worker loaded different sources than the master");
            }
        }

        let registry = Arc::new(std::mem::take(&mut *pool::lock(&self.registry)));
        let mut link = StdioLink::new();
        worker::serve(id, registry, &mut link).await
    }

    /// Invoke `name` with `args` on the next worker.
    ///
    /// In a worker this is inert and resolves to `null` without sending
    /// anything. On the master it fails with `NotLocked` until `lock` has
    /// completed.
    pub fn run(&self, name: &str, args: Vec<Value>) -> RunHandle {
        match self.role {
            Role::Worker { .. } => RunHandle::ready(Ok(Value::Null)),
            Role::Master => match self.dispatcher.get() {
                Some(dispatcher) => dispatcher.run(name, args),
                None => RunHandle::ready(Err(OffloadError::NotLocked)),
            },
        }
    }

    /// Ask every worker to stop. The pool is not restarted afterwards.
    pub fn shutdown(&self) {
        if let Some(dispatcher) = self.dispatcher.get() {
            info!(workers = dispatcher.worker_count(), "shutting down worker pool");
            dispatcher.shutdown();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.dispatcher.get().map_or(0, Dispatcher::worker_count)
    }

    pub fn worker_ids(&self) -> Vec<usize> {
        self.dispatcher
            .get()
            .map(Dispatcher::worker_ids)
            .unwrap_or_default()
    }

    pub fn pending_calls(&self) -> usize {
        self.dispatcher.get().map_or(0, Dispatcher::pending_calls)
    }

    /// Names of the recorded sources, in registration order.
    pub fn sources(&self) -> Vec<String> {
        pool::lock(&self.sources)
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Operations held by this context's registry. Always empty on the master.
    pub fn operations(&self) -> Vec<String> {
        pool::lock(&self.registry).names()
    }
}

impl std::fmt::Debug for Offload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offload")
            .field("role", &self.role)
            .field("backend", &self.config.backend)
            .field("workers", &self.config.workers)
            .field("locked", &self.dispatcher.initialized())
            .finish_non_exhaustive()
    }
}
