#![allow(dead_code)]

use std::time::Duration;

use offload::{Args, Backend, Invocation, Module, OffloadConfig, OperationError};

pub const ADD_RESULT: u64 = 4_999_999_950_000_000;

/// Operations shared by the in-process test pools.
pub fn declare(module: &mut Module<'_>) {
    module
        .operation("add", |_: &mut Args| Invocation::value((0..100_000_000u64).sum::<u64>()))
        .operation("say", |args: &mut Args| {
            let first: Vec<String> = args.next()?;
            Ok(Invocation::curried(move |args: &mut Args| {
                let last: Vec<String> = args.next()?;
                let first = first.join(" ");
                Ok(Invocation::curried(move |args: &mut Args| {
                    let title: Vec<String> = args.next()?;
                    Invocation::value(format!(
                        "Hello {} {} {}!",
                        title.join(" "),
                        first,
                        last.join(" ")
                    ))
                }))
            }))
        })
        .operation("whoami", |args: &mut Args| Invocation::value(args.worker_id()))
        .operation("concat", |args: &mut Args| {
            let parts: Vec<String> = args
                .rest()
                .into_iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            Invocation::value(parts.concat())
        })
        .operation("nap", |args: &mut Args| {
            let millis: u64 = args.next()?;
            Ok(Invocation::deferred(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Invocation::value(millis)
            }))
        })
        .operation("fail", |_: &mut Args| Err(OperationError::failed("refused by worker")));
}

pub fn thread_config(workers: usize) -> OffloadConfig {
    OffloadConfig::default()
        .with_backend(Backend::Thread)
        .with_workers(workers)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
