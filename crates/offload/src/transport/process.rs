//! Process backend: each worker is a re-launch of the configured program.
//!
//! The child learns it is a worker from `OFFLOAD_WORKER_ID`. Commands go in
//! over its stdin, events come back over its stdout, both as length-prefixed
//! frames. The child's stderr is inherited so its logs reach the terminal.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{BufReader, BufWriter, Stdin, Stdout};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Spawner, WorkerChannel, WorkerLink, WorkerSpec};
use crate::config::OffloadConfig;
use crate::error::OffloadError;
use crate::message::{read_frame, write_frame, Command, Event};
use crate::role::{SOURCES_ENV, WORKER_ID_ENV};

/// Spawns worker processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Use the configured program, falling back to the current executable.
    pub fn from_config(config: &OffloadConfig) -> Result<Self, OffloadError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(program, config.program_args.clone()))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerChannel, OffloadError> {
        let sources = spec
            .sources
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut command = ProcessCommand::new(&self.program);
        command
            .args(&self.args)
            .env(WORKER_ID_ENV, spec.id.to_string())
            .env(SOURCES_ENV, sources)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if spec.debug {
            command.env("OFFLOAD_DEBUG", "true");
        }

        let mut child = command.spawn().map_err(|e| {
            warn!(program = %self.program.display(), error = %e, "failed to spawn worker process");
            OffloadError::Io(e)
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OffloadError::Protocol("worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OffloadError::Protocol("worker stdout was not captured".into()))?;

        debug!(worker_id = spec.id, pid = ?child.id(), "worker process spawned");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_commands(spec.id, stdin, commands_rx));
        tokio::spawn(read_events(spec.id, child, stdout, events_tx));

        Ok(WorkerChannel {
            commands: commands_tx,
            events: events_rx,
        })
    }
}

/// Forward queued commands into the child's stdin.
///
/// Ends when the master drops its sender (closing stdin tells the child to
/// exit) or when the pipe breaks.
async fn write_commands(
    worker_id: usize,
    stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut writer = BufWriter::new(stdin);
    while let Some(command) = commands.recv().await {
        if let Err(e) = write_frame(&mut writer, &command).await {
            warn!(worker_id, error = %e, "failed to write to worker process");
            break;
        }
    }
}

/// Forward frames from the child's stdout, then reap the child.
async fn read_events(
    worker_id: usize,
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame::<_, Event>(&mut reader).await {
            Ok(Some(event)) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(worker_id, error = %e, "invalid data from worker process");
                break;
            }
        }
    }
    drop(events);

    match child.wait().await {
        Ok(status) => info!(worker_id, %status, "worker process exited"),
        Err(e) => warn!(worker_id, error = %e, "failed to wait for worker process"),
    }
}

// ── Child side ───────────────────────────────────────────────────────

/// Worker-side link over the process's own stdin/stdout.
pub struct StdioLink {
    stdin: BufReader<Stdin>,
    stdout: BufWriter<Stdout>,
}

impl StdioLink {
    pub fn new() -> Self {
        Self {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: BufWriter::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdioLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLink for StdioLink {
    async fn recv(&mut self) -> Result<Option<Command>, OffloadError> {
        read_frame(&mut self.stdin).await
    }

    async fn send(&mut self, event: Event) -> Result<(), OffloadError> {
        write_frame(&mut self.stdout, &event).await
    }
}
