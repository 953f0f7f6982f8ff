use crate::client::{DiagnoseClient, DiagnoseError};
use crate::engine::{BatchEngine, Phase, SettleOutcome, Ticket};
use crate::model::{BatchCounters, DiagnoseResponse, QueueEntry, ResultRecord};
use anyhow::{anyhow, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Settled = (Ticket, Result<DiagnoseResponse, DiagnoseError>);

/// Everything the presentation layer needs, published after every change.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub phase: Option<Phase>,
    pub counters: BatchCounters,
    pub in_flight: Option<String>,
    pub active_index: Option<usize>,
    pub results: Vec<Arc<ResultRecord>>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    fn capture(engine: &BatchEngine) -> Self {
        Self {
            generation: engine.generation(),
            phase: Some(engine.phase()),
            counters: engine.counters(),
            in_flight: engine.in_flight().map(|t| t.file_name.clone()),
            active_index: engine.active_index(),
            results: engine.results().to_vec(),
            last_error: engine.last_error().map(ToString::to_string),
        }
    }

    pub fn active(&self) -> Option<&Arc<ResultRecord>> {
        self.active_index.and_then(|i| self.results.get(i))
    }

    pub fn is_idle_for(&self, generation: u64) -> bool {
        self.generation == generation && self.phase == Some(Phase::Idle)
    }
}

enum Command {
    Submit {
        files: Vec<QueueEntry>,
        reply: oneshot::Sender<u64>,
    },
    Select {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
}

/// Single owner of the batch engine. All mutation arrives as commands or
/// settles on this one task.
pub struct Session {
    engine: BatchEngine,
    client: Arc<dyn DiagnoseClient>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<SessionSnapshot>,
    outstanding: FuturesUnordered<BoxFuture<'static, Settled>>,
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

pub fn spawn_session(client: Arc<dyn DiagnoseClient>) -> (SessionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    let session = Session {
        engine: BatchEngine::new(),
        client,
        commands: command_rx,
        snapshots: snapshot_tx,
        outstanding: FuturesUnordered::new(),
    };
    let task = tokio::spawn(session.run());
    (
        SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        },
        task,
    )
}

impl Session {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((ticket, outcome)) = self.outstanding.next(), if !self.outstanding.is_empty() => {
                    if let SettleOutcome::Appended { index } = self.engine.settle(&ticket, outcome) {
                        debug!(
                            file = %ticket.file_name,
                            index,
                            active = ?self.engine.active().map(|r| r.file_name.as_str()),
                            "result appended"
                        );
                    }
                    self.pump();
                    self.publish();
                }
            }
        }
        if !self.outstanding.is_empty() {
            info!(
                outstanding = self.outstanding.len(),
                "session closed with requests outstanding"
            );
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { files, reply } => {
                let generation = self.engine.submit_batch(files);
                self.pump();
                self.publish();
                let _ = reply.send(generation);
            }
            Command::Select { index, reply } => {
                let moved = self.engine.select_active(index);
                if moved {
                    self.publish();
                }
                let _ = reply.send(moved);
            }
        }
    }

    /// Starts the next queued item if the in-flight slot is free.
    fn pump(&mut self) {
        let Some(dispatch) = self.engine.next_dispatch() else {
            return;
        };
        let ticket = dispatch.ticket;
        let call = self
            .client
            .diagnose(ticket.file_name.clone(), dispatch.bytes);
        self.outstanding
            .push(async move { (ticket, call.await) }.boxed());
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(SessionSnapshot::capture(&self.engine));
    }
}

impl SessionHandle {
    /// Replaces the current batch. Returns the new batch generation.
    pub async fn submit(&self, files: Vec<QueueEntry>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit { files, reply })
            .map_err(|_| anyhow!("session is closed"))?;
        rx.await.map_err(|_| anyhow!("session dropped submit reply"))
    }

    /// Returns whether the active selection moved. Out-of-range is a no-op.
    pub async fn select(&self, index: usize) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Select { index, reply })
            .map_err(|_| anyhow!("session is closed"))?;
        rx.await.map_err(|_| anyhow!("session dropped select reply"))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub async fn wait_idle(&self, generation: u64) -> Result<SessionSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| s.is_idle_for(generation))
            .await
            .map_err(|_| anyhow!("session ended before batch {generation} finished"))?;
        Ok(snapshot.clone())
    }
}
