// src/publisher.rs
//
// Publisher handle for one exchange. Encoding happens here, before the
// supervisor is ever contacted, so a codec failure can never leave a
// half-sent message behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::debug;

use crate::codec::CodecRegistry;
use crate::config::ClientConfig;
use crate::errors::{Error, Result};
use crate::message::{Headers, OutboundMessage, Payload};
use crate::supervisor::Command;

const OCTET_STREAM: &str = "application/octet-stream";

/// Per-call publish options. Unset fields fall back to the client-wide
/// defaults chosen at construction time.
#[derive(Clone, Default)]
pub struct PublishOpts {
    pub headers: Headers,
    pub content_type: Option<String>,
    /// Bypass the codec and send the payload as already-serialized bytes.
    pub skip_encoding: Option<bool>,
    /// Wait for the broker's publish ack before resolving.
    pub confirm: Option<bool>,
    /// Overrides the configured ack timeout.
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct Publisher {
    exchange: String,
    commands: mpsc::Sender<Command>,
    registry: Arc<CodecRegistry>,
    default_content_type: Option<String>,
    push_back: bool,
    skip_encoding: bool,
    publish_timeout: Duration,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.exchange)
            .field("default_content_type", &self.default_content_type)
            .field("push_back", &self.push_back)
            .field("skip_encoding", &self.skip_encoding)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub(crate) fn new(
        exchange: String,
        commands: mpsc::Sender<Command>,
        registry: Arc<CodecRegistry>,
        config: &ClientConfig,
    ) -> Self {
        Publisher {
            exchange,
            commands,
            registry,
            default_content_type: config.default_content_type.clone(),
            push_back: config.push_back,
            skip_encoding: config.skip_encoding,
            publish_timeout: config.publish_timeout,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn publish(&self, routing_key: &str, payload: Payload) -> Result<()> {
        self.publish_with(routing_key, payload, PublishOpts::default())
            .await
    }

    /// Publishes pre-serialized bytes, bypassing the codec.
    pub async fn publish_raw(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Result<()> {
        self.publish_with(
            routing_key,
            Payload::Raw(body),
            PublishOpts {
                content_type: Some(content_type.into()),
                skip_encoding: Some(true),
                ..PublishOpts::default()
            },
        )
        .await
    }

    pub async fn publish_with(
        &self,
        routing_key: &str,
        payload: Payload,
        opts: PublishOpts,
    ) -> Result<()> {
        let (content_type, body) = self.encode(payload, &opts)?;
        let message = OutboundMessage::new(
            self.exchange.clone(),
            routing_key,
            opts.headers,
            content_type,
            body,
        );
        debug!(
            exchange = %self.exchange,
            routing_key = %routing_key,
            content_type = %message.content_type,
            "publishing message"
        );

        let confirm = opts.confirm.unwrap_or(self.push_back);
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                message,
                confirm,
                done: done_tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;

        if confirm {
            let timeout = opts.timeout.unwrap_or(self.publish_timeout);
            match time::timeout(timeout, done_rx).await {
                Err(_) => Err(Error::PublishTimeout(timeout)),
                Ok(Err(_)) => Err(Error::Cancelled),
                Ok(Ok(result)) => result,
            }
        } else {
            // resolves as soon as the message is handed to the transport
            done_rx.await.map_err(|_| Error::Cancelled)?
        }
    }

    /// Resolves the codec and encodes, or passes raw bytes through when
    /// the bypass is active. Failures here never reach the supervisor.
    fn encode(&self, payload: Payload, opts: &PublishOpts) -> Result<(String, Vec<u8>)> {
        let skip = opts.skip_encoding.unwrap_or(self.skip_encoding);
        let content_type = opts
            .content_type
            .clone()
            .or_else(|| self.default_content_type.clone());

        if skip {
            match payload {
                Payload::Raw(bytes) => {
                    Ok((content_type.unwrap_or_else(|| OCTET_STREAM.to_string()), bytes))
                }
                Payload::Value(_) => Err(Error::Encoding {
                    content_type: content_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
                    source: "skip_encoding set but payload is not raw bytes".into(),
                }),
            }
        } else {
            match payload {
                Payload::Value(value) => {
                    let entry = self.registry.resolve(content_type.as_deref())?;
                    let body = entry.encode(&value)?;
                    Ok((entry.content_type().to_string(), body))
                }
                Payload::Raw(_) => Err(Error::Encoding {
                    content_type: content_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
                    source: "raw payload requires skip_encoding".into(),
                }),
            }
        }
    }
}
