//! Worker execution loop.
//!
//! Signals ready, then turns each inbound [`Call`] into exactly one [`Reply`]
//! carrying the same correlation id. Calls are handled one at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, instrument, trace};

use crate::error::{OffloadError, OperationError, RemoteError, RemoteErrorKind};
use crate::message::{Call, Command, Event, Reply};
use crate::registry::{Args, FunctionRegistry, Invocation, Operation};
use crate::transport::WorkerLink;

/// Run the worker loop until the master hangs up or asks for shutdown.
#[instrument(skip_all, fields(worker_id = worker_id))]
pub async fn serve<L>(
    worker_id: usize,
    registry: Arc<FunctionRegistry>,
    link: &mut L,
) -> Result<(), OffloadError>
where
    L: WorkerLink + ?Sized,
{
    link.send(Event::Ready).await?;
    debug!(worker_id, operations = ?registry.names(), "worker ready");

    while let Some(command) = link.recv().await? {
        match command {
            Command::Call(call) => {
                let reply = execute(worker_id, &registry, call).await;
                link.send(Event::Reply(reply)).await?;
            }
            Command::Shutdown => {
                info!(worker_id, "shutdown requested");
                break;
            }
        }
    }

    debug!(worker_id, "worker loop finished");
    Ok(())
}

/// Execute one call against `registry`. Failures become error replies.
pub async fn execute(worker_id: usize, registry: &FunctionRegistry, call: Call) -> Reply {
    let Call {
        operation,
        correlation_id,
        args,
    } = call;

    let resolved = match registry.lookup(&operation) {
        Ok(op) => op,
        Err(_) => {
            debug!(worker_id, %operation, %correlation_id, "unknown operation");
            return Reply::err(
                correlation_id,
                RemoteError::new(
                    RemoteErrorKind::UnknownOperation,
                    format!("operation '{operation}' is not registered on worker {worker_id}"),
                ),
            );
        }
    };

    match apply(resolved, Args::new(args, worker_id)).await {
        Ok(value) => Reply::ok(correlation_id, value),
        Err(error) => {
            debug!(worker_id, %operation, %correlation_id, %error, "operation failed");
            Reply::err(correlation_id, error)
        }
    }
}

/// Apply an operation, following curried results left to right.
///
/// Each step sees the arguments the previous steps did not consume. The
/// chain stops at the first plain value; it can take at most one step more
/// than there are arguments.
async fn apply(operation: Operation, mut args: Args) -> Result<Value, RemoteError> {
    let max_steps = args.remaining() + 1;
    let mut current = operation;

    for _ in 0..max_steps {
        let (result, rest) = run_step(current, args).await?;
        args = rest;

        match settle(result).await? {
            Settled::Value(value) => {
                if !args.is_empty() {
                    trace!(surplus = args.remaining(), "ignoring surplus arguments");
                }
                return Ok(value);
            }
            Settled::Curried(_) if args.is_empty() => {
                return Err(RemoteError::new(
                    RemoteErrorKind::PartialApplication,
                    format!(
                        "operation returned a callable after consuming all {} arguments",
                        args.position()
                    ),
                ));
            }
            Settled::Curried(next) => current = next,
        }
    }

    Err(RemoteError::new(
        RemoteErrorKind::PartialApplication,
        format!("curried chain did not finish within {max_steps} steps"),
    ))
}

enum Settled {
    Value(Value),
    Curried(Operation),
}

/// Invoke one step on the blocking pool so a panic cannot take the loop down.
async fn run_step(
    operation: Operation,
    mut args: Args,
) -> Result<(Result<Invocation, OperationError>, Args), RemoteError> {
    tokio::task::spawn_blocking(move || {
        let result = operation(&mut args);
        (result, args)
    })
    .await
    .map_err(|e| {
        if e.is_panic() {
            panicked(e.into_panic())
        } else {
            RemoteError::new(RemoteErrorKind::Panicked, "operation was cancelled")
        }
    })
}

/// Drive deferred results until a value or a further callable remains.
async fn settle(result: Result<Invocation, OperationError>) -> Result<Settled, RemoteError> {
    let mut invocation = result?;
    loop {
        invocation = match invocation {
            Invocation::Value(value) => return Ok(Settled::Value(value)),
            Invocation::Curried(next) => return Ok(Settled::Curried(next)),
            Invocation::Deferred(future) => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(panicked)??,
        };
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> RemoteError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "operation panicked".to_string());
    RemoteError::new(RemoteErrorKind::Panicked, message)
}
