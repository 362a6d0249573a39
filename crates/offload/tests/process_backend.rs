//! End-to-end runs against worker processes of the `offload-fixture` binary.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use offload::{args, Backend, Offload, OffloadConfig, OffloadError};
use serde_json::json;

use common::eventually;

const FIXTURE: &str = env!("CARGO_BIN_EXE_offload-fixture");

/// Master-side declarations must name the same source the fixture registers.
fn fixture_source(_: &mut offload::Module<'_>) {}

async fn locked(workers: usize) -> Offload {
    let config = OffloadConfig::default()
        .with_backend(Backend::Process)
        .with_workers(workers)
        .with_program(FIXTURE);
    let offload = Offload::create(config).unwrap();
    offload.register("fixture", fixture_source);
    assert!(offload.lock().await.unwrap());
    offload
}

#[tokio::test]
async fn workers_are_separate_processes() {
    let offload = locked(2).await;
    assert_eq!(offload.worker_ids(), vec![0, 1]);

    let mut pids = HashSet::new();
    for expected in 0..2usize {
        assert_eq!(
            offload.run("whoami", args![]).decode::<usize>().await.unwrap(),
            expected
        );
    }
    for _ in 0..2 {
        pids.insert(offload.run("pid", args![]).decode::<u32>().await.unwrap());
    }
    assert_eq!(pids.len(), 2);
    assert!(!pids.contains(&std::process::id()));

    offload.shutdown();
}

#[tokio::test]
async fn values_cross_the_process_boundary() {
    let offload = locked(1).await;

    let echoed = offload
        .run("echo", args![1, "two", [3.5], json!({"four": null})])
        .await
        .unwrap();
    assert_eq!(echoed, json!([1, "two", [3.5], {"four": null}]));

    let greeting = offload
        .run("say", args![["Mihai"], ["Bojescu"], ["mr."]])
        .await
        .unwrap();
    assert_eq!(greeting, json!("Hello mr. Mihai Bojescu!"));

    let sum: u64 = offload.run("add", args![1_000]).decode().await.unwrap();
    assert_eq!(sum, 499_500);
}

#[tokio::test]
async fn remote_errors_are_reported() {
    let offload = locked(1).await;

    let err = offload.run("missing", args![]).await.unwrap_err();
    assert!(matches!(err, OffloadError::UnknownOperation(name) if name == "missing"));

    match offload.run("fail", args!["disk full"]).await.unwrap_err() {
        OffloadError::OperationFailed { message, .. } => assert!(message.contains("disk full")),
        other => panic!("unexpected error: {other}"),
    }

    // Partial application: `say` needs three arguments.
    let err = offload.run("say", args![["Mihai"]]).await.unwrap_err();
    assert!(matches!(err, OffloadError::OperationFailed { .. }));
}

#[tokio::test]
async fn shutdown_stops_worker_processes() {
    let offload = locked(2).await;
    offload.shutdown();
    assert!(eventually(Duration::from_secs(10), || offload.worker_count() == 0).await);
}

#[test]
fn fixture_runs_as_master() {
    let output = std::process::Command::new(FIXTURE)
        .env("OFFLOAD_BACKEND", "process")
        .env("OFFLOAD_WORKERS", "2")
        .env_remove("OFFLOAD_WORKER_ID")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "fixture failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
