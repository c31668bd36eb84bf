// src/transport.rs
//
// The seam between the client layer and the wire-level protocol engine.
// The supervisor only ever talks to these traits; production code plugs in
// the lapin-backed implementation, tests plug in an in-memory broker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::message::{Inbound, OutboundMessage};

/// Queue declaration parameters, replayed verbatim on every reconnect.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub queue_name: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// One live connection to the broker. Dropped and replaced wholesale on
/// reconnect; never reused after `closed()` resolves.
#[async_trait]
pub trait Session: Send + Sync {
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declares the queue and binds it. Idempotent on the broker side.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Starts consuming. Returns only after the broker has confirmed the
    /// consume is live; the receiver closes when the session dies.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Inbound>>;

    /// Hands the message to the transport. With `confirm`, resolves only
    /// once the broker acknowledges the publish.
    async fn publish(&self, message: &OutboundMessage, confirm: bool) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Resolves when the transport is lost, however that is detected
    /// (closure, error, heartbeat timeout).
    async fn closed(&self);

    /// Graceful close, used by the shutdown drain.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Session>>;
}
