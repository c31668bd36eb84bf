// src/consumer.rs
//
// Consumer bindings: a queue declaration plus the decode-then-dispatch
// loop run for every delivery on that queue. A single bad message never
// stops the loop; failures go through the binding's error handler and end
// in an ack-and-drop or a requeue.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::codec::CodecRegistry;
use crate::errors::{BoxError, Error, Result};
use crate::message::{Delivery, Inbound, Payload};
use crate::transport::{QueueSpec, Session};

/// Message handler. Returning `Err` routes the delivery through the
/// binding's error handler.
pub type Handler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

/// Decision returned by an error handler.
pub enum Recovery {
    /// Substitute a payload and continue as if dispatch had succeeded.
    /// On a decode failure the handler is re-invoked with this payload;
    /// on a handler failure the substitute stands in for its result.
    Resume(Payload),
    /// Let the binding's requeue-on-error policy decide the message's fate.
    Fail,
}

/// Pure decision function from (error, message) to a recovery action.
pub type ErrorHandler = Arc<dyn Fn(&Error, &Delivery) -> Recovery + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |delivery| Box::pin(f(delivery)))
}

/// Wraps a plain closure into an [`ErrorHandler`].
pub fn error_handler<F>(f: F) -> ErrorHandler
where
    F: Fn(&Error, &Delivery) -> Recovery + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Everything needed to (re-)establish one consumer binding. Replayed
/// verbatim, in registration order, after every reconnect.
#[derive(Clone)]
pub struct BindingSpec {
    pub exchange: String,
    pub routing_key: String,
    pub queue_name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub full_content: bool,
    pub skip_decoding: bool,
    pub requeue_on_error: bool,
    pub parallel: bool,
    pub handler: Handler,
    pub error_handler: ErrorHandler,
}

impl BindingSpec {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue_name: impl Into<String>,
        handler: Handler,
    ) -> Self {
        BindingSpec {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            queue_name: queue_name.into(),
            durable: true,
            auto_delete: false,
            full_content: true,
            skip_decoding: false,
            requeue_on_error: false,
            parallel: false,
            handler,
            error_handler: error_handler(|_, _| Recovery::Fail),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn full_content(mut self, full_content: bool) -> Self {
        self.full_content = full_content;
        self
    }

    pub fn skip_decoding(mut self, skip: bool) -> Self {
        self.skip_decoding = skip;
        self
    }

    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn error_handler(mut self, error_handler: ErrorHandler) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub(crate) fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            queue_name: self.queue_name.clone(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            durable: self.durable,
            auto_delete: self.auto_delete,
        }
    }
}

/// Applies a binding on a live session: declare, bind, start consuming,
/// then run the dispatch loop in its own task.
pub(crate) async fn start(
    spec: BindingSpec,
    registry: Arc<CodecRegistry>,
    session: Arc<dyn Session>,
) -> Result<JoinHandle<()>> {
    session.declare_exchange(&spec.exchange).await?;
    session.declare_queue(&spec.queue_spec()).await?;
    let consumer_tag = format!("consumer-{}", Uuid::new_v4());
    let rx = session.consume(&spec.queue_name, &consumer_tag).await?;
    debug!(queue = %spec.queue_name, tag = %consumer_tag, "consume loop started");
    Ok(tokio::spawn(dispatch_loop(spec, registry, session, rx)))
}

async fn dispatch_loop(
    spec: BindingSpec,
    registry: Arc<CodecRegistry>,
    session: Arc<dyn Session>,
    mut rx: mpsc::Receiver<Inbound>,
) {
    while let Some(inbound) = rx.recv().await {
        if spec.parallel {
            let spec = spec.clone();
            let registry = registry.clone();
            let session = session.clone();
            tokio::spawn(async move {
                handle_delivery(&spec, &registry, session.as_ref(), inbound).await;
            });
        } else {
            handle_delivery(&spec, &registry, session.as_ref(), inbound).await;
        }
    }
    debug!(queue = %spec.queue_name, "consume loop ended");
}

async fn handle_delivery(
    spec: &BindingSpec,
    registry: &CodecRegistry,
    session: &dyn Session,
    inbound: Inbound,
) {
    let delivery_tag = inbound.delivery_tag;
    let base = Delivery {
        headers: if spec.full_content {
            inbound.headers
        } else {
            Default::default()
        },
        content_type: inbound.content_type,
        routing_key: inbound.routing_key,
        body: Payload::Raw(inbound.body),
        delivery_tag,
    };

    let outcome = dispatch(spec, registry, base).await;

    let ack_result = match outcome {
        Ok(()) => session.ack(delivery_tag).await,
        Err(err) => {
            error!(
                queue = %spec.queue_name,
                requeue = spec.requeue_on_error,
                error = %err,
                "message dispatch failed"
            );
            if spec.requeue_on_error {
                session.nack(delivery_tag, true).await
            } else {
                // acknowledged-and-dropped: the message must not redeliver
                session.ack(delivery_tag).await
            }
        }
    };
    if let Err(err) = ack_result {
        error!(queue = %spec.queue_name, error = %err, "failed to settle delivery");
    }
}

async fn dispatch(spec: &BindingSpec, registry: &CodecRegistry, base: Delivery) -> Result<()> {
    let decoded = if spec.skip_decoding {
        Ok(base.clone())
    } else {
        decode(registry, &base)
    };

    match decoded {
        Ok(delivery) => match (spec.handler)(delivery.clone()).await {
            Ok(()) => Ok(()),
            Err(cause) => {
                let err = Error::Handler(cause.to_string());
                match (spec.error_handler)(&err, &delivery) {
                    Recovery::Resume(_) => Ok(()),
                    Recovery::Fail => Err(err),
                }
            }
        },
        // handler never ran; error handler may substitute a decoded payload
        Err(err) => match (spec.error_handler)(&err, &base) {
            Recovery::Resume(payload) => {
                let substitute = base.with_body(payload);
                (spec.handler)(substitute)
                    .await
                    .map_err(|cause| Error::Handler(cause.to_string()))
            }
            Recovery::Fail => Err(err),
        },
    }
}

fn decode(registry: &CodecRegistry, base: &Delivery) -> Result<Delivery> {
    let entry = registry.resolve(base.content_type.as_deref())?;
    let bytes = match &base.body {
        Payload::Raw(bytes) => bytes,
        Payload::Value(_) => return Ok(base.clone()),
    };
    let value = entry.decode(bytes)?;
    Ok(base.clone().with_body(Payload::Value(value)))
}
