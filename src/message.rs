// src/message.rs

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Application-level message headers. Values are JSON so heterogeneous
/// producers can attach structured routing metadata without caring about
/// the wire representation.
pub type Headers = BTreeMap<String, Value>;

/// A message body on the application side of the codec boundary.
///
/// `Value` is the decoded (or to-be-encoded) form; `Raw` carries bytes
/// that bypass the codec entirely (skip-encoding / skip-decoding mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Value(Value),
    Raw(Vec<u8>),
}

impl Payload {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(b) => Some(b),
            Payload::Value(_) => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

/// A fully encoded message on its way to the broker. Immutable once it
/// has been handed to the connection supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub content_type: String,
    pub body: Vec<u8>,
    pub message_id: String,
    pub timestamp: i64,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        headers: Headers,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        OutboundMessage {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers,
            content_type: content_type.into(),
            body,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// A raw delivery as it arrives from the transport, before any decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub headers: Headers,
    pub content_type: Option<String>,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

/// A delivery as handed to a consumer handler. Ephemeral, lives for the
/// duration of one dispatch only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub headers: Headers,
    pub content_type: Option<String>,
    pub routing_key: String,
    pub body: Payload,
    pub delivery_tag: u64,
}

impl Delivery {
    pub(crate) fn with_body(mut self, body: Payload) -> Self {
        self.body = body;
        self
    }
}
