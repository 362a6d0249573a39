//! offload-fixture: one program, two roles.
//!
//! Run directly, it is the master: it starts the pool and offloads a few
//! calls. Re-launched by the process backend (with `OFFLOAD_WORKER_ID` set),
//! the same `main` declares the operations and serves them over stdio.
//!
//! Environment:
//!   OFFLOAD_BACKEND  process | thread (default: process)
//!   OFFLOAD_WORKERS  worker count (default: host parallelism)
//!   OFFLOAD_DEBUG    per-call debug logging
//!   RUST_LOG         log filter override

use offload::{args, logging, Args, Invocation, Module, Offload, OffloadConfig, OperationError};
use tracing::info;

const ADD_LIMIT: u64 = 100_000_000;

fn declare(module: &mut Module<'_>) {
    module
        .operation("add", |args: &mut Args| {
            let limit: u64 = args.next_opt()?.unwrap_or(ADD_LIMIT);
            Invocation::value((0..limit).sum::<u64>())
        })
        .operation("say", |args: &mut Args| {
            let first: Vec<String> = args.next()?;
            Ok(Invocation::curried(move |args: &mut Args| {
                let last: Vec<String> = args.next()?;
                let first = first.join(" ");
                Ok(Invocation::curried(move |args: &mut Args| {
                    let title: Vec<String> = args.next()?;
                    let greeting = format!("Hello {} {} {}!", title.join(" "), first, last.join(" "));
                    info!(worker_id = args.worker_id(), "{greeting}");
                    Invocation::value(greeting)
                }))
            }))
        })
        .operation("echo", |args: &mut Args| Invocation::value(args.rest()))
        .operation("whoami", |args: &mut Args| Invocation::value(args.worker_id()))
        .operation("pid", |_: &mut Args| Invocation::value(std::process::id()))
        .operation("fail", |args: &mut Args| {
            let reason: Option<String> = args.next_opt()?;
            Err(OperationError::failed(
                reason.unwrap_or_else(|| "fixture failure".into()),
            ))
        });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    offload::load_dotenv();
    let config = OffloadConfig::from_env()?;
    logging::init(config.debug);

    let offload = Offload::create(config)?;
    offload.register("fixture", declare);

    if !offload.lock().await? {
        return Ok(());
    }

    info!(workers = offload.worker_count(), backend = %offload.backend(), "pool locked");

    let calls: Vec<_> = offload
        .worker_ids()
        .into_iter()
        .map(|_| offload.run("add", args![]))
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        let sum: u64 = call.decode().await?;
        info!(call = i, sum, "add resolved");
    }

    let greeting = offload
        .run("say", args![["Mihai"], ["Bojescu"], ["mr."]])
        .await?;
    info!(%greeting, "say resolved");

    offload.shutdown();
    Ok(())
}
