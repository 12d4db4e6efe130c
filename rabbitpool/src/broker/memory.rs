//! In-process broker.
//!
//! Follows AMQP 0-9-1 semantics closely enough to drive the whole runtime
//! without RabbitMQ: direct, topic and fanout routing, exchange-to-exchange
//! bindings, passive declares that fail on missing targets, manual
//! acknowledgement with redelivery, and publisher confirms. One
//! [`MemoryBroker`] value is shared by cloning; every clone sees the same state.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    Acker, BrokerChannel, BrokerConnection, Confirmation, ConnectionFactory, Delivery,
    DeliveryStream, NoopAcker, PendingConfirm, Qos,
};
use crate::error::{PoolError, Result};
use crate::message::{DeliveryInfo, WireMessage};
use crate::transformer::{
    ConnectionArgs, ConsumeArgs, ExchangeDeclareArgs, PublishArgs, QueueDeclareArgs,
};

const CONSUMER_POLL: Duration = Duration::from_millis(5);
const MAX_EXCHANGE_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Clone)]
struct MemoryBinding {
    destination: Destination,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct MemoryExchange {
    kind: String,
    bindings: Vec<MemoryBinding>,
}

#[derive(Debug, Clone)]
struct Stored {
    message: WireMessage,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

/// A message accepted by `basic_publish`
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: WireMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, VecDeque<Stored>>,
    unacked: HashMap<u64, (String, Stored)>,
    next_tag: u64,
    published: Vec<PublishedMessage>,
    rejected: Vec<WireMessage>,
    heartbeats: usize,
    connections: usize,
    refuse_connections: bool,
    withhold_confirms: bool,
}

fn not_found(kind: &str, name: &str) -> PoolError {
    PoolError::ChannelException {
        reason: format!("NOT_FOUND - no {} '{}' in vhost '/'", kind, name),
    }
}

fn binding_matches(kind: &str, pattern: &str, routing_key: &str) -> bool {
    match kind {
        "fanout" | "headers" => true,
        "topic" => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
        _ => pattern == routing_key,
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(word), Some(part)) if word == part => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, message: &WireMessage, hops: usize) -> Result<usize> {
        if exchange.is_empty() {
            return Ok(match self.queues.get_mut(routing_key) {
                Some(queue) => {
                    queue.push_back(Stored {
                        message: message.clone(),
                        exchange: String::new(),
                        routing_key: routing_key.to_string(),
                        redelivered: false,
                    });
                    1
                }
                None => 0,
            });
        }

        let target = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;
        let destinations: Vec<Destination> = target
            .bindings
            .iter()
            .filter(|binding| binding_matches(&target.kind, &binding.routing_key, routing_key))
            .map(|binding| binding.destination.clone())
            .collect();

        let mut routed = 0;
        for destination in destinations {
            match destination {
                Destination::Queue(name) => {
                    if let Some(queue) = self.queues.get_mut(&name) {
                        queue.push_back(Stored {
                            message: message.clone(),
                            exchange: exchange.to_string(),
                            routing_key: routing_key.to_string(),
                            redelivered: false,
                        });
                        routed += 1;
                    }
                }
                Destination::Exchange(name) if hops < MAX_EXCHANGE_HOPS => {
                    routed += self.route(&name, routing_key, message, hops + 1)?;
                }
                Destination::Exchange(_) => {}
            }
        }
        Ok(routed)
    }
}

/// Shared in-process broker state
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| PoolError::internal_error("memory broker state poisoned"))
    }

    fn inspect<T>(&self, read: impl FnOnce(&BrokerState) -> T) -> T {
        let guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        read(&guard)
    }

    fn update(&self, write: impl FnOnce(&mut BrokerState)) {
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        write(&mut guard)
    }

    /// Declare a queue directly, bypassing any channel
    pub fn declare_queue(&self, name: &str) {
        self.update(|state| {
            state.queues.entry(name.to_string()).or_default();
        });
    }

    /// Append a message to a queue as if it had been routed there
    pub fn enqueue(&self, queue: &str, message: WireMessage) {
        self.update(|state| {
            state.queues.entry(queue.to_string()).or_default().push_back(Stored {
                message,
                exchange: String::new(),
                routing_key: queue.to_string(),
                redelivered: false,
            });
        });
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inspect(|state| state.queues.contains_key(name))
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inspect(|state| state.exchanges.contains_key(name))
    }

    /// Whether `source` routes `routing_key` bindings to `destination` (queue or exchange)
    pub fn is_bound(&self, source: &str, destination: &str, routing_key: &str) -> bool {
        self.inspect(|state| {
            state.exchanges.get(source).is_some_and(|exchange| {
                exchange.bindings.iter().any(|binding| {
                    binding.routing_key == routing_key
                        && match &binding.destination {
                            Destination::Queue(name) | Destination::Exchange(name) => name == destination,
                        }
                })
            })
        })
    }

    /// Ready messages in a queue, excluding unacknowledged ones
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inspect(|state| state.queues.get(name).map(VecDeque::len).unwrap_or(0))
    }

    pub fn unacked_count(&self) -> usize {
        self.inspect(|state| state.unacked.len())
    }

    /// Messages nacked without requeue
    pub fn rejected(&self) -> Vec<WireMessage> {
        self.inspect(|state| state.rejected.clone())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inspect(|state| state.published.clone())
    }

    pub fn heartbeats(&self) -> usize {
        self.inspect(|state| state.heartbeats)
    }

    pub fn connections(&self) -> usize {
        self.inspect(|state| state.connections)
    }

    /// Make every subsequent `connect` fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.update(|state| state.refuse_connections = refuse);
    }

    /// Return every unacknowledged delivery to its queue, flagged as
    /// redelivered, the way a broker does when a consumer channel resets.
    /// Settling one of those deliveries afterwards fails.
    pub fn requeue_unacked(&self) {
        self.update(|state| {
            let mut pending: Vec<(u64, (String, Stored))> = state.unacked.drain().collect();
            pending.sort_by_key(|(tag, _)| *tag);
            for (_, (queue, mut stored)) in pending.into_iter().rev() {
                stored.redelivered = true;
                state.queues.entry(queue).or_default().push_front(stored);
            }
        });
    }

    /// Leave publisher confirms pending forever
    pub fn withhold_confirms(&self, withhold: bool) {
        self.update(|state| state.withhold_confirms = withhold);
    }

    fn take(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let stored = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found("queue", queue))?
            .pop_front();

        let Some(stored) = stored else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let info = DeliveryInfo {
            delivery_tag,
            redelivered: stored.redelivered,
            exchange: stored.exchange.clone(),
            routing_key: stored.routing_key.clone(),
        };
        let message = stored.message.clone();

        let acker: Box<dyn Acker> = if no_ack {
            Box::new(NoopAcker)
        } else {
            state
                .unacked
                .insert(delivery_tag, (queue.to_string(), stored));
            Box::new(MemoryAcker {
                broker: self.clone(),
                delivery_tag,
            })
        };

        Ok(Some(Delivery::new(info, message, acker)))
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn connect(&self, _args: &ConnectionArgs) -> Result<Box<dyn BrokerConnection>> {
        let mut state = self.lock()?;
        if state.refuse_connections {
            return Err(PoolError::ConnectionClosed {
                reason: "connection refused".to_string(),
            });
        }
        state.connections += 1;
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(MutexGuard<'_, BrokerState>, String, Stored)> {
        let mut state = self.broker.lock()?;
        let (queue, stored) = state.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            PoolError::ChannelException {
                reason: format!("PRECONDITION_FAILED - unknown delivery tag {}", self.delivery_tag),
            }
        })?;
        Ok((state, queue, stored))
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle().map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let (mut state, queue, mut stored) = self.settle()?;
        if requeue {
            stored.redelivered = true;
            state.queues.entry(queue).or_default().push_front(stored);
        } else {
            state.rejected.push(stored.message);
        }
        Ok(())
    }
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(PoolError::ConnectionClosed {
                reason: "connection closed".to_string(),
            });
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            confirm: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn heartbeat(&self) -> Result<()> {
        self.broker.lock()?.heartbeats += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`]
pub struct MemoryChannel {
    broker: MemoryBroker,
    closed: AtomicBool,
    confirm: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::ChannelException {
                reason: "channel is closed".to_string(),
            });
        }
        Ok(())
    }

    /// A channel exception closes the channel, like the broker would
    fn fail(&self, error: PoolError) -> PoolError {
        if matches!(error, PoolError::ChannelException { .. }) {
            self.closed.store(true, Ordering::SeqCst);
        }
        error
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, args: &ExchangeDeclareArgs) -> Result<()> {
        self.ensure_open()?;
        if args.exchange.is_empty() {
            return Ok(());
        }
        let mut state = self.broker.lock()?;
        if args.passive {
            if !state.exchanges.contains_key(&args.exchange) {
                return Err(self.fail(not_found("exchange", &args.exchange)));
            }
            return Ok(());
        }
        state
            .exchanges
            .entry(args.exchange.clone())
            .or_insert_with(|| MemoryExchange {
                kind: args.kind.clone(),
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn queue_declare(&self, args: &QueueDeclareArgs) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;
        if args.passive {
            if !state.queues.contains_key(&args.queue) {
                return Err(self.fail(not_found("queue", &args.queue)));
            }
            return Ok(());
        }
        state.queues.entry(args.queue.clone()).or_default();
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;
        if !state.queues.contains_key(queue) {
            return Err(self.fail(not_found("queue", queue)));
        }
        let source = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| self.fail(not_found("exchange", exchange)))?;
        source.bindings.push(MemoryBinding {
            destination: Destination::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn exchange_bind(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;
        if !state.exchanges.contains_key(destination) {
            return Err(self.fail(not_found("exchange", destination)));
        }
        let source_exchange = state
            .exchanges
            .get_mut(source)
            .ok_or_else(|| self.fail(not_found("exchange", source)))?;
        source_exchange.bindings.push(MemoryBinding {
            destination: Destination::Exchange(destination.to_string()),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;
        let ready = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| self.fail(not_found("queue", queue)))?;
        let purged = ready.len();
        ready.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn basic_qos(&self, _qos: &Qos) -> Result<()> {
        self.ensure_open()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        self.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(&self, args: &PublishArgs, message: WireMessage) -> Result<PendingConfirm> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;
        let routed = state
            .route(&args.exchange, &args.routing_key, &message, 0)
            .map_err(|e| self.fail(e))?;
        state.published.push(PublishedMessage {
            exchange: args.exchange.clone(),
            routing_key: args.routing_key.clone(),
            message,
        });

        if state.withhold_confirms {
            return Ok(Box::pin(futures_util::future::pending()));
        }

        let confirmation = if !self.confirm.load(Ordering::SeqCst) {
            Confirmation::NotRequested
        } else if args.mandatory && routed == 0 {
            Confirmation::Returned
        } else {
            Confirmation::Ack
        };
        Ok(Box::pin(async move { Ok(confirmation) }))
    }

    async fn basic_consume(&self, args: &ConsumeArgs) -> Result<DeliveryStream> {
        self.ensure_open()?;
        if !self.broker.has_queue(&args.queue) {
            return Err(self.fail(not_found("queue", &args.queue)));
        }

        let no_ack = args.no_ack;
        let stream = futures_util::stream::unfold(
            (self.broker.clone(), args.queue.clone()),
            move |(broker, queue)| async move {
                loop {
                    match broker.take(&queue, no_ack) {
                        Ok(Some(delivery)) => return Some((Ok(delivery), (broker, queue))),
                        Ok(None) => tokio::time::sleep(CONSUMER_POLL).await,
                        Err(e) => return Some((Err(e), (broker, queue))),
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        self.broker.take(queue, false).map_err(|e| self.fail(e))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
