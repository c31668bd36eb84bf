// src/supervisor.rs
//
// Owns the lifecycle of one broker connection: connect, detect failure,
// back off, reconnect, and replay the registered topology. All shared
// mutable state (connection state, the bounded outbound buffer, the
// topology list) lives inside the supervisor task; the rest of the crate
// talks to it over one command channel.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

use crate::codec::CodecRegistry;
use crate::config::ClientConfig;
use crate::consumer::{self, BindingSpec};
use crate::errors::{Error, Result};
use crate::message::OutboundMessage;
use crate::transport::{Session, Transport};

/// Connection lifecycle. `Draining` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

pub(crate) enum Command {
    Publish {
        message: OutboundMessage,
        confirm: bool,
        done: oneshot::Sender<Result<()>>,
    },
    DeclareExchange {
        exchange: String,
        done: oneshot::Sender<Result<()>>,
    },
    Bind {
        spec: BindingSpec,
        ready: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct PendingPublish {
    message: OutboundMessage,
    confirm: bool,
    done: oneshot::Sender<Result<()>>,
}

enum TopologyEntry {
    Exchange {
        name: String,
    },
    Binding {
        spec: BindingSpec,
        /// Start barrier: resolved the first time the binding is applied
        /// on a live session.
        ready: Option<oneshot::Sender<Result<()>>>,
    },
}

pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    registry: Arc<CodecRegistry>,
) -> (mpsc::Sender<Command>, watch::Receiver<ConnectionState>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(128);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let supervisor = Supervisor {
        transport,
        config,
        registry,
        state_tx,
        topology: Vec::new(),
        pending: VecDeque::new(),
        consume_tasks: Vec::new(),
        inflight: JoinSet::new(),
    };
    tokio::spawn(supervisor.run(cmd_rx));
    (cmd_tx, state_rx)
}

struct Supervisor {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    registry: Arc<CodecRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    topology: Vec<TopologyEntry>,
    pending: VecDeque<PendingPublish>,
    consume_tasks: Vec<JoinHandle<()>>,
    inflight: JoinSet<()>,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut session: Option<Arc<dyn Session>> = None;
        let mut attempt: u32 = 0;
        let mut retry_at = Instant::now();
        let mut gave_up = false;

        loop {
            if let Some(live) = session.clone() {
                tokio::select! {
                    _ = live.closed() => {
                        warn!("connection to broker lost, scheduling reconnect");
                        self.teardown_consumers();
                        self.set_state(ConnectionState::Connecting);
                        session = None;
                        attempt = 0;
                        retry_at = Instant::now();
                    }
                    cmd = commands.recv() => match cmd {
                        None => {
                            self.drain(Some(live), None).await;
                            return;
                        }
                        Some(Command::Shutdown { done }) => {
                            self.drain(Some(live), Some(done)).await;
                            return;
                        }
                        Some(cmd) => self.handle_connected(cmd, &live).await,
                    },
                }
            } else if gave_up {
                match commands.recv().await {
                    None => {
                        self.drain(None, None).await;
                        return;
                    }
                    Some(Command::Shutdown { done }) => {
                        self.drain(None, Some(done)).await;
                        return;
                    }
                    Some(cmd) => self.handle_gave_up(cmd),
                }
            } else {
                tokio::select! {
                    _ = time::sleep_until(retry_at) => {
                        self.set_state(ConnectionState::Connecting);
                        match self.establish().await {
                            Ok(live) => {
                                info!("connected to broker");
                                self.set_state(ConnectionState::Connected);
                                self.flush_pending(&live).await;
                                session = Some(live);
                                attempt = 0;
                            }
                            Err(err) => {
                                attempt += 1;
                                if self
                                    .config
                                    .max_reconnect_attempts
                                    .is_some_and(|max| attempt >= max)
                                {
                                    error!(attempt, error = %err, "max reconnection attempts reached, giving up");
                                    gave_up = true;
                                    self.set_state(ConnectionState::Disconnected);
                                    self.fail_pending(|| Error::ConnectionLost);
                                    self.fail_pending_bindings(|| Error::ConnectionLost);
                                } else {
                                    let delay = self.config.backoff.delay_for(attempt - 1);
                                    warn!(
                                        attempt,
                                        delay_ms = delay.as_millis() as u64,
                                        error = %err,
                                        "connect failed, retrying"
                                    );
                                    retry_at = Instant::now() + delay;
                                }
                            }
                        }
                    }
                    cmd = commands.recv() => match cmd {
                        None => {
                            self.drain(None, None).await;
                            return;
                        }
                        Some(Command::Shutdown { done }) => {
                            self.drain(None, Some(done)).await;
                            return;
                        }
                        Some(cmd) => self.handle_disconnected(cmd),
                    },
                }
            }
        }
    }

    /// Connects and replays the registered topology in registration order.
    /// Any failure drops the session so the whole attempt retries.
    async fn establish(&mut self) -> Result<Arc<dyn Session>> {
        let session = self.transport.connect().await?;

        for index in 0..self.topology.len() {
            let applied = match &self.topology[index] {
                TopologyEntry::Exchange { name } => {
                    let name = name.clone();
                    session.declare_exchange(&name).await
                }
                TopologyEntry::Binding { spec, .. } => {
                    let spec = spec.clone();
                    match consumer::start(spec, self.registry.clone(), session.clone()).await {
                        Ok(task) => {
                            self.consume_tasks.push(task);
                            if let TopologyEntry::Binding { ready, .. } = &mut self.topology[index]
                            {
                                if let Some(tx) = ready.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            };

            if let Err(err) = applied {
                error!(error = %err, "topology replay failed, dropping session");
                self.teardown_consumers();
                let _ = session.close().await;
                return Err(err);
            }
        }

        Ok(session)
    }

    async fn handle_connected(&mut self, cmd: Command, session: &Arc<dyn Session>) {
        match cmd {
            Command::Publish {
                message,
                confirm,
                done,
            } => self.send_now(session, message, confirm, done).await,
            Command::DeclareExchange { exchange, done } => {
                let result = session.declare_exchange(&exchange).await;
                self.topology.push(TopologyEntry::Exchange { name: exchange });
                let _ = done.send(result);
            }
            Command::Bind { spec, ready } => {
                match consumer::start(spec.clone(), self.registry.clone(), session.clone()).await {
                    Ok(task) => {
                        self.consume_tasks.push(task);
                        self.topology
                            .push(TopologyEntry::Binding { spec, ready: None });
                        let _ = ready.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = ready.send(Err(err));
                    }
                }
            }
            Command::Shutdown { done } => {
                // handled by the caller; resolve defensively
                let _ = done.send(());
            }
        }
    }

    fn handle_disconnected(&mut self, cmd: Command) {
        match cmd {
            Command::Publish {
                message,
                confirm,
                done,
            } => {
                if self.pending.len() >= self.config.pending_limit {
                    let _ = done.send(Err(Error::Backpressure(self.pending.len())));
                } else {
                    self.pending.push_back(PendingPublish {
                        message,
                        confirm,
                        done,
                    });
                }
            }
            Command::DeclareExchange { exchange, done } => {
                // declared on the next successful connect
                self.topology.push(TopologyEntry::Exchange { name: exchange });
                let _ = done.send(Ok(()));
            }
            Command::Bind { spec, ready } => {
                self.topology.push(TopologyEntry::Binding {
                    spec,
                    ready: Some(ready),
                });
            }
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn handle_gave_up(&mut self, cmd: Command) {
        match cmd {
            Command::Publish { done, .. } => {
                let _ = done.send(Err(Error::ConnectionLost));
            }
            Command::DeclareExchange { done, .. } => {
                let _ = done.send(Err(Error::ConnectionLost));
            }
            Command::Bind { ready, .. } => {
                let _ = ready.send(Err(Error::ConnectionLost));
            }
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    /// Hands one message to the live session. Confirmed publishes wait for
    /// the broker ack off the supervisor loop so a slow ack cannot stall
    /// command processing or disconnect detection.
    async fn send_now(
        &mut self,
        session: &Arc<dyn Session>,
        message: OutboundMessage,
        confirm: bool,
        done: oneshot::Sender<Result<()>>,
    ) {
        if confirm {
            let session = session.clone();
            self.inflight.spawn(async move {
                let result = session
                    .publish(&message, true)
                    .await
                    .map_err(Error::into_connection_lost);
                let _ = done.send(result);
            });
        } else {
            let result = session.publish(&message, false).await;
            let _ = done.send(result);
        }
    }

    async fn flush_pending(&mut self, session: &Arc<dyn Session>) {
        if self.pending.is_empty() {
            return;
        }
        info!(count = self.pending.len(), "flushing buffered publishes");
        while let Some(p) = self.pending.pop_front() {
            self.send_now(session, p.message, p.confirm, p.done).await;
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        while let Some(p) = self.pending.pop_front() {
            let _ = p.done.send(Err(err()));
        }
    }

    fn fail_pending_bindings(&mut self, err: impl Fn() -> Error) {
        for entry in &mut self.topology {
            if let TopologyEntry::Binding { ready, .. } = entry {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(err()));
                }
            }
        }
    }

    fn teardown_consumers(&mut self) {
        for task in self.consume_tasks.drain(..) {
            task.abort();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Cooperative drain: refuse new work, resolve every queued waiter,
    /// give in-flight acks until the shutdown timeout, then close.
    async fn drain(&mut self, session: Option<Arc<dyn Session>>, done: Option<oneshot::Sender<()>>) {
        info!("draining client");
        self.set_state(ConnectionState::Draining);
        self.fail_pending(|| Error::Cancelled);
        self.fail_pending_bindings(|| Error::Cancelled);

        let waited = time::timeout(self.config.shutdown_timeout, async {
            while self.inflight.join_next().await.is_some() {}
        })
        .await;
        if waited.is_err() {
            warn!("shutdown timed out waiting for in-flight acks");
            self.inflight.abort_all();
        }

        self.teardown_consumers();
        if let Some(session) = session {
            if let Err(err) = session.close().await {
                warn!(error = %err, "error closing transport");
            }
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
        info!("client drained");
    }
}
