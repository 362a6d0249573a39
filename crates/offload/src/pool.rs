//! Worker provisioning and selection.
//!
//! [`WorkerPool::initialize`] starts workers one after another and waits for
//! each readiness signal before starting the next. Workers leave the
//! selection set when their channel closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::OffloadConfig;
use crate::cycling::CyclingStrategy;
use crate::error::OffloadError;
use crate::message::{Command, Event};
use crate::registry::Source;
use crate::transport::{Spawner, WorkerChannel, WorkerSpec};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ── WorkerHandle ────────────────────────────────────────────────────

/// Master-side handle on one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    commands: mpsc::UnboundedSender<Command>,
    ready: bool,
    available: AtomicBool,
}

impl WorkerHandle {
    fn new(id: usize, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            commands,
            ready: false,
            available: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    /// Queue a command for this worker.
    pub fn send(&self, command: Command) -> Result<(), OffloadError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(OffloadError::WorkerUnavailable(self.id));
        }
        self.commands
            .send(command)
            .map_err(|_| OffloadError::WorkerUnavailable(self.id))
    }

    fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }
}

/// Inbound event stream of one ready worker.
#[derive(Debug)]
pub struct Inbox {
    pub worker_id: usize,
    pub events: mpsc::UnboundedReceiver<Event>,
}

// ── WorkerPool ──────────────────────────────────────────────────────

/// Ordered collection of ready workers plus the selection cursor.
#[derive(Debug)]
pub struct WorkerPool {
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    cursor: Mutex<usize>,
    cycling: CyclingStrategy,
}

impl WorkerPool {
    /// Spawn `config.workers` workers, waiting for each one to signal ready.
    ///
    /// Returns the pool together with each worker's steady-state inbox.
    #[instrument(skip_all, fields(workers = config.workers, backend = %config.backend))]
    pub async fn initialize(
        config: &OffloadConfig,
        spawner: &dyn Spawner,
        sources: &[Source],
    ) -> Result<(Self, Vec<Inbox>), OffloadError> {
        config.validate()?;

        let mut workers = Vec::with_capacity(config.workers);
        let mut inboxes = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let spec = WorkerSpec {
                id,
                sources: sources.to_vec(),
                debug: config.debug,
            };
            let WorkerChannel {
                commands,
                mut events,
            } = spawner.spawn(spec).await?;

            let mut handle = WorkerHandle::new(id, commands);
            await_ready(id, &mut events, config.startup_timeout()).await?;
            handle.ready = true;
            if config.debug {
                debug!(worker_id = id, "worker signalled ready");
            }

            workers.push(Arc::new(handle));
            inboxes.push(Inbox {
                worker_id: id,
                events,
            });
        }

        info!(workers = workers.len(), cycling = config.cycling.name(), "worker pool ready");

        Ok((
            Self {
                workers: RwLock::new(workers),
                cursor: Mutex::new(0),
                cycling: config.cycling.clone(),
            },
            inboxes,
        ))
    }

    /// Pick the worker for the next call and advance the cursor.
    pub fn select(&self) -> Result<Arc<WorkerHandle>, OffloadError> {
        let workers = read(&self.workers);
        if workers.is_empty() {
            return Err(OffloadError::NoWorkers);
        }
        let max = workers.len() - 1;

        let mut cursor = lock(&self.cursor);
        let index = (*cursor).min(max);
        let next = self.cycling.next(index, max);
        *cursor = if next > max {
            warn!(
                cycling = self.cycling.name(),
                next, max, "cycling strategy returned an out-of-range index, resetting to 0"
            );
            0
        } else {
            next
        };

        Ok(Arc::clone(&workers[index]))
    }

    /// Drop a worker from future selection. Returns `false` if it was already gone.
    pub fn remove(&self, worker_id: usize) -> bool {
        let mut workers = write(&self.workers);
        let Some(position) = workers.iter().position(|w| w.id == worker_id) else {
            return false;
        };
        let removed = workers.remove(position);
        removed.mark_unavailable();

        let mut cursor = lock(&self.cursor);
        if *cursor > position {
            *cursor -= 1;
        }
        if *cursor >= workers.len() {
            *cursor = 0;
        }
        true
    }

    pub fn get(&self, worker_id: usize) -> Option<Arc<WorkerHandle>> {
        read(&self.workers)
            .iter()
            .find(|w| w.id == worker_id)
            .cloned()
    }

    /// Snapshot of the live workers in selection order.
    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        read(&self.workers).clone()
    }

    pub fn ids(&self) -> Vec<usize> {
        read(&self.workers).iter().map(|w| w.id).collect()
    }

    pub fn len(&self) -> usize {
        read(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wait for the single readiness signal that precedes steady-state traffic.
async fn await_ready(
    worker_id: usize,
    events: &mut mpsc::UnboundedReceiver<Event>,
    timeout: Duration,
) -> Result<(), OffloadError> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                Event::Ready => return Ok(()),
                Event::Reply(reply) => warn!(
                    worker_id,
                    correlation_id = %reply.correlation_id,
                    "reply received before ready signal, dropped"
                ),
            }
        }
        Err(OffloadError::WorkerUnavailable(worker_id))
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| OffloadError::WorkerStartupTimeout {
            worker: worker_id,
            timeout,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_pair, ChannelLink, WorkerLink};
    use async_trait::async_trait;
    use tokio::sync::mpsc::error::TryRecvError;

    /// Signals ready once per worker and keeps the worker ends open.
    #[derive(Default)]
    struct ReadyOnce {
        links: Mutex<Vec<ChannelLink>>,
    }

    #[async_trait]
    impl Spawner for ReadyOnce {
        async fn spawn(&self, _spec: WorkerSpec) -> Result<WorkerChannel, OffloadError> {
            let (channel, mut link) = channel_pair();
            link.send(Event::Ready).await?;
            lock(&self.links).push(link);
            Ok(channel)
        }
    }

    #[tokio::test]
    async fn initialized_workers_are_ready_exactly_once() {
        let spawner = ReadyOnce::default();
        let config = OffloadConfig::default().with_workers(3);
        let (pool, mut inboxes) = WorkerPool::initialize(&config, &spawner, &[]).await.unwrap();

        assert_eq!(pool.ids(), vec![0, 1, 2]);
        assert!(pool.handles().iter().all(|w| w.is_ready() && w.is_available()));

        // The ready signal was consumed by initialization, not left for the inbox.
        for inbox in &mut inboxes {
            assert!(matches!(inbox.events.try_recv(), Err(TryRecvError::Empty)));
        }
        assert_eq!(lock(&spawner.links).len(), 3);
    }

    fn pool_of(n: usize, cycling: CyclingStrategy) -> WorkerPool {
        let workers = (0..n)
            .map(|id| {
                let (channel, _link) = channel_pair();
                Arc::new(WorkerHandle::new(id, channel.commands))
            })
            .collect();
        WorkerPool {
            workers: RwLock::new(workers),
            cursor: Mutex::new(0),
            cycling,
        }
    }

    fn picks(pool: &WorkerPool, n: usize) -> Vec<usize> {
        (0..n).map(|_| pool.select().unwrap().id()).collect()
    }

    #[test]
    fn round_robin_selection_order() {
        let pool = pool_of(4, CyclingStrategy::round_robin());
        assert_eq!(picks(&pool, 9), vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn out_of_range_strategy_resets_to_zero() {
        let pool = pool_of(3, CyclingStrategy::new("overshoot", |current, _| current + 10));
        assert_eq!(picks(&pool, 3), vec![0, 0, 0]);
    }

    #[test]
    fn removed_workers_leave_selection() {
        let pool = pool_of(3, CyclingStrategy::round_robin());
        assert_eq!(pool.select().unwrap().id(), 0);
        let second = pool.get(1).unwrap();

        assert!(pool.remove(1));
        assert!(!pool.remove(1));
        assert!(!second.is_available());
        assert!(second.send(Command::Shutdown).is_err());

        assert_eq!(pool.ids(), vec![0, 2]);
        assert_eq!(picks(&pool, 4), vec![2, 0, 2, 0]);
    }

    #[test]
    fn empty_pool_reports_no_workers() {
        let pool = pool_of(1, CyclingStrategy::round_robin());
        assert!(pool.remove(0));
        assert!(pool.is_empty());
        assert!(matches!(pool.select(), Err(OffloadError::NoWorkers)));
    }

    #[tokio::test]
    async fn ready_wait_times_out() {
        let (mut channel, _link) = channel_pair();
        let err = await_ready(7, &mut channel.events, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::WorkerStartupTimeout { worker: 7, .. }
        ));
    }

    #[tokio::test]
    async fn ready_wait_fails_when_worker_goes_away() {
        let (mut channel, link) = channel_pair();
        drop(link);
        let err = await_ready(2, &mut channel.events, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::WorkerUnavailable(2)));
    }
}
