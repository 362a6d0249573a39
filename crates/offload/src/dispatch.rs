//! Master-side call dispatch.
//!
//! Every `run` selects a worker, records a pending entry under a fresh
//! correlation id and queues the call. One pump task per worker routes
//! replies back to the matching [`RunHandle`]. When a worker's channel
//! closes, it leaves the pool and its outstanding calls are rejected.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::OffloadError;
use crate::message::{Call, Command, CorrelationId, Event, Outcome, Reply};
use crate::pool::{lock, Inbox, WorkerPool};

type Resolver = oneshot::Sender<Result<Value, OffloadError>>;

/// A call that has been sent and awaits its reply.
struct PendingCall {
    worker_id: usize,
    operation: String,
    resolver: Resolver,
}

struct Shared {
    pool: WorkerPool,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    debug: bool,
    closing: AtomicBool,
}

impl Shared {
    /// Settle the pending call matching `reply`.
    fn resolve(&self, worker_id: usize, reply: Reply) {
        let Reply {
            correlation_id,
            outcome,
        } = reply;

        let Some(call) = lock(&self.pending).remove(&correlation_id) else {
            let error = OffloadError::CorrelationMismatch(correlation_id);
            warn!(worker_id, %correlation_id, %error, "reply dropped");
            return;
        };

        if self.debug {
            debug!(worker_id, %correlation_id, operation = %call.operation, "reply received");
        }

        let result = match outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(remote) => Err(OffloadError::from_remote(&call.operation, remote)),
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = call.resolver.send(result);
    }

    /// Take a worker out of rotation and fail everything routed to it.
    fn worker_lost(&self, worker_id: usize) {
        let removed = self.pool.remove(worker_id);

        let orphaned: Vec<(CorrelationId, PendingCall)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, call)| call.worker_id == worker_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };

        if self.closing.load(Ordering::SeqCst) {
            debug!(worker_id, "worker stopped");
        } else if removed {
            warn!(
                worker_id,
                rejected = orphaned.len(),
                remaining = self.pool.len(),
                "worker went away, removed from pool"
            );
        }

        for (correlation_id, call) in orphaned {
            debug!(worker_id, %correlation_id, operation = %call.operation, "rejecting pending call");
            let _ = call
                .resolver
                .send(Err(OffloadError::WorkerUnavailable(worker_id)));
        }
    }
}

/// Routes calls to workers and replies back to callers.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    call_timeout: Option<Duration>,
    runtime: Handle,
}

impl Dispatcher {
    /// Take ownership of a ready pool and start one reply pump per worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        pool: WorkerPool,
        inboxes: Vec<Inbox>,
        call_timeout: Option<Duration>,
        debug: bool,
    ) -> Self {
        let shared = Arc::new(Shared {
            pool,
            pending: Mutex::new(HashMap::new()),
            debug,
            closing: AtomicBool::new(false),
        });

        for inbox in inboxes {
            tokio::spawn(pump(Arc::downgrade(&shared), inbox));
        }

        Self {
            shared,
            call_timeout,
            runtime: Handle::current(),
        }
    }

    /// Send `operation(args)` to the next worker.
    ///
    /// The call is queued before this returns; the handle resolves with the
    /// worker's result. A configured call timeout counts from here, whether
    /// or not the handle is ever awaited.
    #[instrument(skip_all, fields(operation = %operation))]
    pub fn run(&self, operation: &str, args: Vec<Value>) -> RunHandle {
        let worker = match self.shared.pool.select() {
            Ok(worker) => worker,
            Err(e) => return RunHandle::ready(Err(e)),
        };
        let worker_id = worker.id();
        let (tx, rx) = oneshot::channel();

        let correlation_id = {
            let mut pending = lock(&self.shared.pending);
            let correlation_id = loop {
                let candidate = Uuid::new_v4();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            pending.insert(
                correlation_id,
                PendingCall {
                    worker_id,
                    operation: operation.to_string(),
                    resolver: tx,
                },
            );
            correlation_id
        };

        if self.shared.debug {
            debug!(worker_id, %correlation_id, %operation, "running");
        }

        let call = Command::Call(Call {
            operation: operation.to_string(),
            correlation_id,
            args,
        });
        if let Err(e) = worker.send(call) {
            lock(&self.shared.pending).remove(&correlation_id);
            self.shared.worker_lost(worker_id);
            return RunHandle {
                correlation_id: None,
                worker_id: Some(worker_id),
                inner: future::ready(Err(e)).boxed(),
            };
        }

        if let Some(limit) = self.call_timeout {
            let deadline = Instant::now() + limit;
            self.runtime.spawn(expire(
                Arc::downgrade(&self.shared),
                correlation_id,
                deadline,
                limit,
            ));
        }

        let inner = async move {
            rx.await
                .unwrap_or(Err(OffloadError::WorkerUnavailable(worker_id)))
        }
        .boxed();

        RunHandle {
            correlation_id: Some(correlation_id),
            worker_id: Some(worker_id),
            inner,
        }
    }

    /// Ask every live worker to stop. Their pending calls are rejected as
    /// each channel closes.
    pub fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        for worker in self.shared.pool.handles() {
            if worker.send(Command::Shutdown).is_err() {
                debug!(worker_id = worker.id(), "worker already gone at shutdown");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.pool.len()
    }

    pub fn worker_ids(&self) -> Vec<usize> {
        self.shared.pool.ids()
    }

    /// Calls sent but not yet answered, rejected or timed out.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}

/// Fail a call that is still pending at `deadline`.
async fn expire(
    shared: Weak<Shared>,
    correlation_id: CorrelationId,
    deadline: Instant,
    limit: Duration,
) {
    tokio::time::sleep_until(deadline).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let Some(call) = lock(&shared.pending).remove(&correlation_id) else {
        return;
    };
    debug!(worker_id = call.worker_id, %correlation_id, operation = %call.operation, "call timed out");
    let _ = call.resolver.send(Err(OffloadError::CallTimeout {
        operation: call.operation,
        timeout: limit,
    }));
}

/// Route one worker's events until its channel closes or the dispatcher is gone.
async fn pump(shared: Weak<Shared>, mut inbox: Inbox) {
    let worker_id = inbox.worker_id;
    while let Some(event) = inbox.events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            Event::Reply(reply) => shared.resolve(worker_id, reply),
            Event::Ready => warn!(worker_id, "duplicate ready signal ignored"),
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.worker_lost(worker_id);
    }
}

// ── RunHandle ───────────────────────────────────────────────────────

/// Eventual result of one `run`.
///
/// Resolves with the worker's value, or with the error that prevented one.
/// Dropping the handle does not cancel the call.
#[must_use = "a RunHandle does nothing unless awaited"]
pub struct RunHandle {
    correlation_id: Option<CorrelationId>,
    worker_id: Option<usize>,
    inner: BoxFuture<'static, Result<Value, OffloadError>>,
}

impl RunHandle {
    /// A handle that is already settled.
    pub fn ready(result: Result<Value, OffloadError>) -> Self {
        Self {
            correlation_id: None,
            worker_id: None,
            inner: future::ready(result).boxed(),
        }
    }

    /// Correlation id of the call, if it was sent.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Worker the call was routed to, if one was selected.
    pub fn worker_id(&self) -> Option<usize> {
        self.worker_id
    }

    /// Await the result and decode it into `T`.
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T, OffloadError> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for RunHandle {
    type Output = Result<Value, OffloadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("correlation_id", &self.correlation_id)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffloadConfig;
    use crate::error::{RemoteError, RemoteErrorKind};
    use crate::transport::{channel_pair, ChannelLink, Spawner, WorkerChannel, WorkerLink, WorkerSpec};
    use async_trait::async_trait;
    use serde_json::json;

    /// Hands out channel pairs and keeps the worker ends for the test to drive.
    #[derive(Default)]
    struct Scripted {
        links: Mutex<Vec<ChannelLink>>,
    }

    #[async_trait]
    impl Spawner for Scripted {
        async fn spawn(&self, _spec: WorkerSpec) -> Result<WorkerChannel, OffloadError> {
            let (channel, mut link) = channel_pair();
            link.send(Event::Ready).await?;
            lock(&self.links).push(link);
            Ok(channel)
        }
    }

    async fn dispatcher(workers: usize, timeout: Option<Duration>) -> (Dispatcher, Vec<ChannelLink>) {
        let spawner = Scripted::default();
        let config = OffloadConfig::default().with_workers(workers);
        let (pool, inboxes) = WorkerPool::initialize(&config, &spawner, &[]).await.unwrap();
        let links = std::mem::take(&mut *lock(&spawner.links));
        (Dispatcher::new(pool, inboxes, timeout, true), links)
    }

    async fn next_call(link: &mut ChannelLink) -> Call {
        match link.recv().await.unwrap() {
            Some(Command::Call(call)) => call,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_resolve_matching_handles_out_of_order() {
        let (dispatcher, mut links) = dispatcher(1, None).await;
        let first = dispatcher.run("a", vec![json!(1)]);
        let second = dispatcher.run("b", vec![json!(2)]);
        assert_eq!(dispatcher.pending_calls(), 2);

        let link = &mut links[0];
        let call_a = next_call(link).await;
        let call_b = next_call(link).await;
        assert_eq!(Some(call_a.correlation_id), first.correlation_id());
        assert_ne!(call_a.correlation_id, call_b.correlation_id);

        link.send(Event::Reply(Reply::ok(call_b.correlation_id, json!("b"))))
            .await
            .unwrap();
        link.send(Event::Reply(Reply::ok(call_a.correlation_id, json!("a"))))
            .await
            .unwrap();

        assert_eq!(second.await.unwrap(), json!("b"));
        assert_eq!(first.await.unwrap(), json!("a"));
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_correlation_ids_are_ignored() {
        let (dispatcher, mut links) = dispatcher(1, None).await;
        let handle = dispatcher.run("a", vec![]);
        let call = next_call(&mut links[0]).await;

        links[0]
            .send(Event::Reply(Reply::ok(Uuid::new_v4(), json!("stray"))))
            .await
            .unwrap();
        links[0].send(Event::Ready).await.unwrap();
        links[0]
            .send(Event::Reply(Reply::ok(call.correlation_id, json!("mine"))))
            .await
            .unwrap();
        // A second reply for an id that is already settled is dropped too.
        links[0]
            .send(Event::Reply(Reply::ok(call.correlation_id, json!("again"))))
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap(), json!("mine"));
        assert_eq!(dispatcher.worker_count(), 1);
    }

    #[tokio::test]
    async fn error_replies_surface_as_errors() {
        let (dispatcher, mut links) = dispatcher(1, None).await;
        let handle = dispatcher.run("nope", vec![]);
        let call = next_call(&mut links[0]).await;
        links[0]
            .send(Event::Reply(Reply::err(
                call.correlation_id,
                RemoteError::new(RemoteErrorKind::UnknownOperation, "not here"),
            )))
            .await
            .unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err, OffloadError::UnknownOperation(name) if name == "nope"));
    }

    #[tokio::test]
    async fn lost_worker_rejects_its_calls_and_leaves_rotation() {
        let (dispatcher, mut links) = dispatcher(2, None).await;
        let on_zero = dispatcher.run("a", vec![]);
        let on_one = dispatcher.run("b", vec![]);
        assert_eq!(on_zero.worker_id(), Some(0));
        assert_eq!(on_one.worker_id(), Some(1));

        let survivor = links.remove(0);
        drop(links);

        let err = on_one.await.unwrap_err();
        assert!(matches!(err, OffloadError::WorkerUnavailable(1)));
        assert_eq!(dispatcher.worker_ids(), vec![0]);

        for _ in 0..3 {
            assert_eq!(dispatcher.run("c", vec![]).worker_id(), Some(0));
        }

        drop(survivor);
        assert!(matches!(
            on_zero.await.unwrap_err(),
            OffloadError::WorkerUnavailable(0)
        ));
        assert_eq!(dispatcher.worker_count(), 0);
        assert!(matches!(
            dispatcher.run("d", vec![]).await.unwrap_err(),
            OffloadError::NoWorkers
        ));
    }

    #[tokio::test]
    async fn call_timeout_discards_pending_entry() {
        let (dispatcher, _links) = dispatcher(1, Some(Duration::from_millis(20))).await;
        let err = dispatcher.run("slow", vec![]).await.unwrap_err();
        assert!(matches!(err, OffloadError::CallTimeout { operation, .. } if operation == "slow"));
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn call_timeout_counts_from_dispatch() {
        let (dispatcher, _links) = dispatcher(1, Some(Duration::from_millis(50))).await;
        let handle = dispatcher.run("slow", vec![]);
        assert_eq!(dispatcher.pending_calls(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.pending_calls(), 0);

        let err = handle.await.unwrap_err();
        assert!(matches!(err, OffloadError::CallTimeout { operation, .. } if operation == "slow"));
    }

    #[tokio::test]
    async fn replies_before_the_deadline_win() {
        let (dispatcher, mut links) = dispatcher(1, Some(Duration::from_millis(100))).await;
        let handle = dispatcher.run("quick", vec![]);
        let call = next_call(&mut links[0]).await;
        links[0]
            .send(Event::Reply(Reply::ok(call.correlation_id, json!("done"))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn shutdown_reaches_every_worker() {
        let (dispatcher, mut links) = dispatcher(2, None).await;
        dispatcher.shutdown();
        for link in &mut links {
            assert_eq!(link.recv().await.unwrap(), Some(Command::Shutdown));
        }
    }

    #[tokio::test]
    async fn decode_maps_result_types() {
        let (dispatcher, mut links) = dispatcher(1, None).await;
        let handle = dispatcher.run("n", vec![]);
        let call = next_call(&mut links[0]).await;
        links[0]
            .send(Event::Reply(Reply::ok(call.correlation_id, json!([1, 2]))))
            .await
            .unwrap();
        let numbers: Vec<u8> = handle.decode().await.unwrap();
        assert_eq!(numbers, vec![1, 2]);

        let err = RunHandle::ready(Ok(json!("x"))).decode::<u8>().await.unwrap_err();
        assert!(matches!(err, OffloadError::ResultDecode(_)));
    }
}
