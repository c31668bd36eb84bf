// src/patterns.rs
//
// Compositions of publisher + consumer binding observed in production use:
// the two-hop store-and-forward relay and the push/wait request-response
// bridge. No new infrastructure, just wiring.

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::consumer::{handler, BindingSpec, Handler};
use crate::errors::{BoxError, Error, Result};
use crate::factory::Client;
use crate::message::{Delivery, Payload};
use crate::publisher::{PublishOpts, Publisher};

/// Header naming the routing key replies should go back to.
pub const ROUTE_BACK: &str = "route_back";
/// Marker set by the first relay hop; its presence means the message has
/// already been forwarded once and names the final destination.
pub const REAL_ROUTE_BACK: &str = "real_route_back";

/// Handler implementing the two-hop relay.
///
/// First hop (no marker yet): stash the original `route_back` under
/// `real_route_back`, point `route_back` at `relay_key`, republish to
/// `relay_key`. Second hop (marker present): republish to the stashed
/// destination. The marker guarantees exactly two hops, never a loop.
///
/// Bodies pass through byte-for-byte; the relay never decodes them, so
/// the same handler works for both hops regardless of content type.
pub fn forward_handler(publisher: Publisher, relay_key: impl Into<String>) -> Handler {
    let relay_key = relay_key.into();
    handler(move |delivery: Delivery| {
        let publisher = publisher.clone();
        let relay_key = relay_key.clone();
        async move {
            let body = match delivery.body {
                Payload::Raw(bytes) => bytes,
                Payload::Value(value) => serde_json::to_vec(&value)?,
            };
            let mut headers = delivery.headers;

            let destination = match headers.get(REAL_ROUTE_BACK) {
                None => {
                    let original = headers.get(ROUTE_BACK).cloned().unwrap_or(Value::Null);
                    headers.insert(REAL_ROUTE_BACK.to_string(), original);
                    headers.insert(ROUTE_BACK.to_string(), Value::String(relay_key.clone()));
                    relay_key.clone()
                }
                Some(real) => real
                    .as_str()
                    .ok_or_else(|| BoxError::from("real_route_back header is not a string"))?
                    .to_string(),
            };

            publisher
                .publish_with(
                    &destination,
                    Payload::Raw(body),
                    PublishOpts {
                        headers,
                        content_type: delivery.content_type,
                        skip_encoding: Some(true),
                        ..PublishOpts::default()
                    },
                )
                .await?;
            Ok(())
        }
    })
}

/// Convenience: the relay binding for one hop of the forwarder, raw
/// bodies in and out.
pub fn forward_binding(
    client: &Client,
    exchange: &str,
    listen_key: &str,
    queue_name: &str,
    publisher: Publisher,
    relay_key: &str,
) -> BindingSpec {
    client
        .binding(
            exchange,
            listen_key,
            queue_name,
            forward_handler(publisher, relay_key),
        )
        .skip_decoding(true)
        .durable(false)
        .auto_delete(true)
}

/// Bridges request/response semantics onto the async consume loop: pushes
/// wait for the broker ack, and decoded replies are held for an external
/// caller to await instead of being processed inline.
pub struct SynClient {
    publisher: Publisher,
    routing_key: String,
    responses: Mutex<mpsc::Receiver<Delivery>>,
}

impl SynClient {
    pub async fn setup(
        client: &Client,
        exchange: &str,
        push_key: &str,
        reply_key: &str,
        reply_queue: &str,
    ) -> Result<SynClient> {
        let (reply_tx, reply_rx) = mpsc::channel(64);
        let reply_handler = handler(move |delivery: Delivery| {
            let reply_tx = reply_tx.clone();
            async move {
                reply_tx
                    .send(delivery)
                    .await
                    .map_err(|_| BoxError::from("response waiter is gone"))
            }
        });

        let spec = client
            .binding(exchange, reply_key, reply_queue, reply_handler)
            .durable(false)
            .auto_delete(true);
        client.setup_read_queue(spec).await?;

        let publisher = client.publisher(exchange).await?;
        Ok(SynClient {
            publisher,
            routing_key: push_key.to_string(),
            responses: Mutex::new(reply_rx),
        })
    }

    /// Publishes and waits for the broker's ack.
    pub async fn push_message(&self, payload: Payload) -> Result<()> {
        self.push_message_with(payload, PublishOpts::default()).await
    }

    pub async fn push_message_with(&self, payload: Payload, mut opts: PublishOpts) -> Result<()> {
        opts.confirm = Some(true);
        self.publisher
            .publish_with(&self.routing_key, payload, opts)
            .await
    }

    /// Awaits the next decoded reply. Fails with `Error::Cancelled` after
    /// shutdown rather than waiting forever.
    pub async fn next_response(&self) -> Result<Delivery> {
        self.responses
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::Cancelled)
    }
}
