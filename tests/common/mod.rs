// Shared in-memory broker used by the integration tests. Routes published
// messages through declared bindings, tracks ack/nack bookkeeping, and can
// refuse connects or kill the live connection to exercise the reconnect
// state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use relinkmq::{Error, Inbound, OutboundMessage, QueueSpec, Result, Session, Transport};

#[derive(Default)]
struct QueueState {
    bindings: Vec<(String, String)>,
    consumer: Option<mpsc::Sender<Inbound>>,
    backlog: Vec<Inbound>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: Vec<String>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    unacked: HashMap<u64, (String, Inbound)>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    published: Vec<OutboundMessage>,
    connects: u32,
    fail_connects: u32,
    hold_confirms: bool,
    declare_counts: HashMap<String, u32>,
    sessions: Vec<Arc<watch::Sender<bool>>>,
}

impl BrokerState {
    fn route(&mut self, message: &OutboundMessage) {
        self.published.push(message.clone());
        let mut deliveries = Vec::new();
        for (name, queue) in &self.queues {
            let bound = queue
                .bindings
                .iter()
                .any(|(ex, rk)| *ex == message.exchange && *rk == message.routing_key);
            if bound {
                deliveries.push(name.clone());
            }
        }
        for name in deliveries {
            self.next_tag += 1;
            let inbound = Inbound {
                headers: message.headers.clone(),
                content_type: Some(message.content_type.clone()),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                delivery_tag: self.next_tag,
            };
            self.deliver(&name, inbound);
        }
    }

    fn deliver(&mut self, queue_name: &str, inbound: Inbound) {
        self.unacked
            .insert(inbound.delivery_tag, (queue_name.to_string(), inbound.clone()));
        if let Some(queue) = self.queues.get_mut(queue_name) {
            match &queue.consumer {
                Some(tx) => {
                    if tx.try_send(inbound.clone()).is_err() {
                        queue.backlog.push(inbound);
                    }
                }
                None => queue.backlog.push(inbound),
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[allow(dead_code)]
impl MockBroker {
    pub fn new() -> Self {
        MockBroker::default()
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().unwrap().fail_connects = n;
    }

    /// Routes confirmed publishes but never delivers the broker ack.
    pub fn hold_confirms(&self) {
        self.state.lock().unwrap().hold_confirms = true;
    }

    /// Simulates a transport-level failure of every live connection.
    pub fn kill_connection(&self) {
        let mut state = self.state.lock().unwrap();
        for session in state.sessions.drain(..) {
            let _ = session.send(false);
        }
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn declare_count(&self, queue: &str) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .declare_counts
            .get(queue)
            .unwrap_or(&0)
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().nacked.clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(&self) -> Result<Arc<dyn Session>> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::Connection("connection refused".to_string()));
        }
        let (alive_tx, alive_rx) = watch::channel(true);
        let alive_tx = Arc::new(alive_tx);
        state.sessions.push(alive_tx.clone());
        Ok(Arc::new(MockSession {
            state: self.state.clone(),
            alive_tx,
            alive: alive_rx,
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<BrokerState>>,
    alive_tx: Arc<watch::Sender<bool>>,
    alive: watch::Receiver<bool>,
}

impl MockSession {
    fn ensure_alive(&self) -> Result<()> {
        if *self.alive.borrow() {
            Ok(())
        } else {
            Err(Error::Connection("link down".to_string()))
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().unwrap();
        if !state.exchanges.iter().any(|e| e == exchange) {
            state.exchanges.push(exchange.to_string());
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().unwrap();
        *state
            .declare_counts
            .entry(spec.queue_name.clone())
            .or_insert(0) += 1;
        let queue = state.queues.entry(spec.queue_name.clone()).or_default();
        let binding = (spec.exchange.clone(), spec.routing_key.clone());
        if !queue.bindings.contains(&binding) {
            queue.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<mpsc::Receiver<Inbound>> {
        self.ensure_alive()?;
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().unwrap();
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Consume(format!("no such queue: {queue}")))?;
        for inbound in queue.backlog.drain(..) {
            let _ = tx.try_send(inbound);
        }
        queue.consumer = Some(tx);
        Ok(rx)
    }

    async fn publish(&self, message: &OutboundMessage, confirm: bool) -> Result<()> {
        self.ensure_alive()?;
        let stalled = {
            let mut state = self.state.lock().unwrap();
            state.route(message);
            confirm && state.hold_confirms
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().unwrap();
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().unwrap();
        state.nacked.push((delivery_tag, requeue));
        if let Some((queue_name, inbound)) = state.unacked.remove(&delivery_tag) {
            if requeue {
                state.deliver(&queue_name, inbound);
            }
        }
        Ok(())
    }

    async fn closed(&self) {
        let mut alive = self.alive.clone();
        loop {
            if !*alive.borrow() {
                return;
            }
            if alive.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // clean close only takes this session down
        let _ = self.alive_tx.send(false);
        let mut state = self.state.lock().unwrap();
        let closing = Arc::as_ptr(&self.alive_tx);
        state.sessions.retain(|s| Arc::as_ptr(s) != closing);
        Ok(())
    }
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Polls until the condition holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
