//! Worker provisioning backends.
//!
//! A [`Spawner`] creates one worker execution context and hands back a
//! [`WorkerChannel`]: an outbound queue of [`Command`]s and an inbound stream
//! of [`Event`]s. The first event a healthy worker emits is [`Event::Ready`].
//! On the worker side, the execution loop talks to the master through a
//! [`WorkerLink`].

pub mod process;
pub mod thread;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::OffloadError;
use crate::message::{Command, Event};
use crate::registry::Source;

pub use process::{ProcessSpawner, StdioLink};
pub use thread::ThreadSpawner;

/// Everything a backend needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: usize,
    /// Sources the worker loads before signalling ready, in registration order.
    pub sources: Vec<Source>,
    pub debug: bool,
}

/// Master-side ends of a worker's message channel.
#[derive(Debug)]
pub struct WorkerChannel {
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<Event>,
}

/// Creates worker execution contexts.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start one worker. The returned channel must yield [`Event::Ready`]
    /// once the worker has loaded its operations.
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerChannel, OffloadError>;
}

/// Worker-side message endpoint.
#[async_trait]
pub trait WorkerLink: Send {
    /// Next command from the master; `None` once the master hung up.
    async fn recv(&mut self) -> Result<Option<Command>, OffloadError>;

    async fn send(&mut self, event: Event) -> Result<(), OffloadError>;
}

/// Worker-side ends of an in-memory channel.
#[derive(Debug)]
pub struct ChannelLink {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl WorkerLink for ChannelLink {
    async fn recv(&mut self) -> Result<Option<Command>, OffloadError> {
        Ok(self.commands.recv().await)
    }

    async fn send(&mut self, event: Event) -> Result<(), OffloadError> {
        self.events
            .send(event)
            .map_err(|_| OffloadError::Protocol("master side of the channel is closed".into()))
    }
}

/// Create a connected master/worker channel pair.
pub fn channel_pair() -> (WorkerChannel, ChannelLink) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (
        WorkerChannel {
            commands: commands_tx,
            events: events_rx,
        },
        ChannelLink {
            commands: commands_rx,
            events: events_tx,
        },
    )
}
