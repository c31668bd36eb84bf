//! Reconnecting RabbitMQ client layer.
//!
//! Sits above the wire-level AMQP implementation (lapin) and gives
//! application code a stable interface for publishing and consuming
//! messages across broker disconnects: automatic reconnection with
//! backoff and topology replay, content-type based payload codecs with
//! skip bypasses, and per-message consumer error handling with
//! requeue/drop semantics.
//!
//! Entry point is [`Client`]: one client owns one broker connection, and
//! every [`Publisher`] and consumer binding created through it is
//! re-established automatically after a reconnect.

pub mod codec;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod factory;
mod lapin_transport;
pub mod message;
pub mod patterns;
pub mod publisher;
mod supervisor;
pub mod transport;

pub use codec::{CodecEntry, CodecRegistry, CodecRegistryBuilder, DecodeFn, EncodeFn, APPLICATION_JSON};
pub use config::{BackoffPolicy, ClientConfig};
pub use consumer::{error_handler, handler, BindingSpec, ErrorHandler, Handler, Recovery};
pub use errors::{BoxError, Error, Result};
pub use factory::Client;
pub use lapin_transport::LapinTransport;
pub use message::{Delivery, Headers, Inbound, OutboundMessage, Payload};
pub use publisher::{PublishOpts, Publisher};
pub use supervisor::ConnectionState;
pub use transport::{QueueSpec, Session, Transport};
