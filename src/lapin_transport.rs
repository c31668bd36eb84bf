// src/lapin_transport.rs
//
// Production transport backed by lapin. One connection plus one channel
// per session; publisher confirms are enabled so synchronous publishes can
// wait on the broker ack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::errors::{Error, Result};
use crate::message::{Headers, Inbound, OutboundMessage};
use crate::transport::{QueueSpec, Session, Transport};

pub struct LapinTransport {
    uri: String,
    confirms: bool,
}

impl LapinTransport {
    pub fn new(uri: impl Into<String>) -> Self {
        LapinTransport {
            uri: uri.into(),
            confirms: true,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        LapinTransport {
            uri: with_heartbeat(&config.uri, config.heartbeat),
            confirms: true,
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>> {
        info!(uri = %self.uri, "connecting to broker");
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        let (alive_tx, alive_rx) = watch::channel(true);
        let alive_tx = Arc::new(alive_tx);
        let conn_alive = alive_tx.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "transport error signalled");
            let _ = conn_alive.send(false);
        });
        // a channel exception kills consumes and acks even while the
        // connection stays up; treat it as session death
        let chan_alive = alive_tx.clone();
        channel.on_error(move |err| {
            warn!(error = %err, "channel error signalled");
            let _ = chan_alive.send(false);
        });

        Ok(Arc::new(LapinSession {
            connection,
            channel,
            alive_tx,
            alive: alive_rx,
        }))
    }
}

struct LapinSession {
    connection: Connection,
    channel: Channel,
    alive_tx: Arc<watch::Sender<bool>>,
    alive: watch::Receiver<bool>,
}

#[async_trait]
impl Session for LapinSession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Channel(format!("failed to declare exchange: {e}")))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &spec.queue_name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Channel(format!("failed to declare queue: {e}")))?;

        self.channel
            .queue_bind(
                &spec.queue_name,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Channel(format!("failed to bind queue: {e}")))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Inbound>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Consume(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(pump_deliveries(
            consumer,
            tx,
            self.alive_tx.clone(),
            queue.to_string(),
        ));
        Ok(rx)
    }

    async fn publish(&self, message: &OutboundMessage, confirm: bool) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(message.message_id.as_str().into())
            .with_content_type(message.content_type.as_str().into())
            .with_timestamp(message.timestamp.max(0) as u64)
            .with_headers(headers_to_table(&message.headers));

        let confirmation = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;

        if confirm {
            match confirmation.await? {
                Confirmation::Nack(_) => {
                    Err(Error::Connection("publish nacked by broker".to_string()))
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Channel(format!("failed to ack: {e}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| Error::Channel(format!("failed to nack: {e}")))
    }

    async fn closed(&self) {
        let mut alive = self.alive.clone();
        loop {
            if !*alive.borrow() || !self.connection.status().connected() {
                return;
            }
            tokio::select! {
                changed = alive.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                // status poll catches closures that never reach on_error
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(0, "client shutdown")
            .await
            .map_err(Error::from)
    }
}

/// Bridges the lapin consume stream into the session's inbound channel.
/// A stream error means the channel died under the consumer, so the
/// session is marked dead to force a teardown and topology replay.
async fn pump_deliveries<S>(
    mut stream: S,
    tx: mpsc::Sender<Inbound>,
    alive_tx: Arc<watch::Sender<bool>>,
    queue: String,
) where
    S: futures::Stream<Item = std::result::Result<lapin::message::Delivery, lapin::Error>>
        + Unpin
        + Send,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(delivery) => {
                let inbound = Inbound {
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(table_to_headers)
                        .unwrap_or_default(),
                    content_type: delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|ct| ct.as_str().to_string()),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    body: delivery.data,
                    delivery_tag: delivery.delivery_tag,
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "consume stream failed, marking session dead");
                let _ = alive_tx.send(false);
                break;
            }
        }
    }
}

fn with_heartbeat(uri: &str, heartbeat: Option<u16>) -> String {
    match heartbeat {
        Some(secs) if !uri.contains("heartbeat=") => {
            let sep = if uri.contains('?') { '&' } else { '?' };
            format!("{uri}{sep}heartbeat={secs}")
        }
        _ => uri.to_string(),
    }
}

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), json_to_amqp(value));
    }
    table
}

fn table_to_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(items.iter().map(json_to_amqp).collect::<Vec<_>>().into())
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.as_str().into(), json_to_amqp(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i as i64),
        AMQPValue::ShortShortUInt(i) => Value::from(*i as i64),
        AMQPValue::ShortInt(i) => Value::from(*i as i64),
        AMQPValue::ShortUInt(i) => Value::from(*i as i64),
        AMQPValue::LongInt(i) => Value::from(*i as i64),
        AMQPValue::LongUInt(i) => Value::from(*i as i64),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Float(f) => Value::from(*f as f64),
        AMQPValue::Double(d) => Value::from(*d),
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(amqp_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
                .collect(),
        ),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().map(|&b| Value::from(b)).collect())
        }
        // decimals have no JSON counterpart
        _ => Value::Null,
    }
}
