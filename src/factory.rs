// src/factory.rs
//
// Composition root: one connection supervisor plus the publishers and
// consumer bindings registered on it. Everything created through a
// `Client` shares the supervisor's connection and is re-established
// together, in registration order, after every reconnect.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::CodecRegistry;
use crate::config::ClientConfig;
use crate::consumer::{BindingSpec, Handler};
use crate::errors::{Error, Result};
use crate::lapin_transport::LapinTransport;
use crate::publisher::Publisher;
use crate::supervisor::{self, Command, ConnectionState};
use crate::transport::Transport;

#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    registry: Arc<CodecRegistry>,
    config: ClientConfig,
}

impl Client {
    /// Connects to the broker named in the config over the lapin
    /// transport. Returns immediately; use [`Client::connected`] to wait
    /// for the first successful connection.
    pub fn connect(config: ClientConfig, registry: CodecRegistry) -> Client {
        let transport = Arc::new(LapinTransport::from_config(&config));
        Client::with_transport(config, registry, transport)
    }

    /// Same as [`Client::connect`] but over a caller-supplied transport.
    pub fn with_transport(
        config: ClientConfig,
        registry: CodecRegistry,
        transport: Arc<dyn Transport>,
    ) -> Client {
        let registry = Arc::new(registry);
        let (commands, state) = supervisor::spawn(transport, config.clone(), registry.clone());
        Client {
            commands,
            state,
            registry,
            config,
        }
    }

    /// Resolves once the connection reaches `Connected` for the first
    /// time (and immediately on every later call while connected).
    pub async fn connected(&self) {
        let mut state = self.state.clone();
        loop {
            if *state.borrow() == ConnectionState::Connected {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watchable state stream, for callers that want to observe the
    /// reconnect lifecycle.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Declares the exchange (now, or at the next connect if currently
    /// down) and returns a publisher bound to it.
    pub async fn publisher(&self, exchange: &str) -> Result<Publisher> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::DeclareExchange {
                exchange: exchange.to_string(),
                done: done_tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        done_rx.await.map_err(|_| Error::Cancelled)??;
        Ok(Publisher::new(
            exchange.to_string(),
            self.commands.clone(),
            self.registry.clone(),
            &self.config,
        ))
    }

    /// Builds a binding spec seeded with this client's configured
    /// defaults (`parallel`, `skip_decoding`, `full_content`).
    pub fn binding(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue_name: impl Into<String>,
        handler: Handler,
    ) -> BindingSpec {
        BindingSpec::new(exchange, routing_key, queue_name, handler)
            .parallel(self.config.parallel)
            .skip_decoding(self.config.skip_decoding)
            .full_content(self.config.full_content)
    }

    /// Registers a consumer binding and starts consuming. Resolves only
    /// once the broker has confirmed the consume loop is live, so a
    /// message published right after this call cannot be missed.
    pub async fn setup_read_queue(&self, spec: BindingSpec) -> Result<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        self.commands
            .send(Command::Bind {
                spec,
                ready: ready_tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        ready_rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Drains and tears down the client. Idempotent: later calls return
    /// immediately once draining has begun.
    pub async fn shutdown(&self) -> Result<()> {
        if *self.state.borrow() == ConnectionState::Draining {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: done_tx })
            .await
            .is_err()
        {
            // supervisor already gone
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}
