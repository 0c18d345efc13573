// src/broker/memory.rs

//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! broker traits. It is intended primarily for testing, local execution, and
//! as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker models the parts of AMQP 0-9-1 the state machines
//! depend on:
//!
//! - Direct, fanout, topic and headers exchanges (headers routes like
//!   fanout), exchange-to-exchange bindings and alternate exchanges.
//! - Per-channel, monotonically increasing delivery tags; cumulative
//!   (`multiple`) ack, nack and reject; requeue marks messages redelivered.
//! - Closing a channel or connection requeues its unacknowledged messages,
//!   deletes exclusive queues of the connection and auto-delete queues that
//!   lost their last consumer.
//! - A failed passive check closes the channel, as a real broker does.
//! - Prefetch limits per channel and `max_length` (drop-head) per queue.
//!
//! ## Fault injection and inspection
//!
//! Tests drive failure paths through [`MemoryBroker`] methods such as
//! [`fail_next_connects`](MemoryBroker::fail_next_connects),
//! [`disconnect_all`](MemoryBroker::disconnect_all) and
//! [`set_blocked`](MemoryBroker::set_blocked), and observe broker-facing
//! traffic through [`calls`](MemoryBroker::calls).
//!
//! ## Non-Goals
//!
//! Persistence, transactions, message TTLs and the rest of the broker feature
//! set are not modelled.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

#[allow(unused_imports)]
use crate::{
    // ---
    domain::{
        Broker,
        BrokerChannel,
        BrokerPtr,
        BrokerConnection,
        ChannelPtr,
        ConnectionPtr,
        ConsumeParams,
        Delivery,
        Endpoint,
        ExchangeDef,
        ExchangeKind,
        MessageProperties,
        QueueDef,
    },
    log_debug,
    log_info,
    BusError,
    Result,
};

const CONSUMER_BUFFER: usize = 1024;

/// One broker-facing operation, as recorded by [`MemoryBroker::calls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    DeclareExchange(String),
    CheckExchange(String),
    DeclareQueue(String),
    CheckQueue(String),
    BindQueue {
        queue: String,
        exchange: String,
        key: String,
    },
    BindExchange {
        destination: String,
        source: String,
        key: String,
    },
    Qos(u16),
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Cancel(String),
    Publish {
        exchange: String,
        routing_key: String,
    },
    Ack {
        tag: u64,
        multiple: bool,
    },
    Nack {
        tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Reject {
        tag: u64,
        multiple: bool,
    },
    Purge(String),
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    tag: String,
    no_ack: bool,
    tx: mpsc::Sender<Delivery>,
}

struct QueueState {
    def: QueueDef,
    owner: u64,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    had_consumer: bool,
}

#[derive(Debug, Clone)]
struct BindingRow {
    source: String,
    destination: String,
    key: String,
    to_queue: bool,
}

struct ChannelState {
    connection: u64,
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    closed_tx: watch::Sender<Option<BusError>>,
}

struct ConnectionState {
    closed_tx: watch::Sender<Option<BusError>>,
}

#[derive(Default)]
struct Faults {
    fail_connects: u32,
    unreachable: HashSet<String>,
    fail_declares: HashSet<String>,
    fail_publishes: bool,
    fail_acks: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDef>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingRow>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    faults: Faults,
    calls: Vec<BrokerCall>,
    attempts: Vec<String>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared in-process broker.
///
/// Every [`MemoryConnection`] opened through the same `MemoryBroker` sees the
/// same exchanges, queues and bindings, exactly as clients of one real broker
/// would.
///
/// Cloning is cheap; every clone refers to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    // ---
    shared: Arc<Shared>,
}

struct Shared {
    // ---
    state: Mutex<State>,
    blocked: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock_ignore_poison(&self.state)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        // ---
        let (blocked, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                blocked,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    // --- fault injection

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().faults.fail_connects = count;
    }

    /// Refuse every connection attempt to `host` while `unreachable`.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        // ---
        let mut state = self.lock();
        if unreachable {
            state.faults.unreachable.insert(host.to_string());
        } else {
            state.faults.unreachable.remove(host);
        }
    }

    /// Make every declare or check of `name` fail.
    pub fn fail_declare(&self, name: &str, fail: bool) {
        // ---
        let mut state = self.lock();
        if fail {
            state.faults.fail_declares.insert(name.to_string());
        } else {
            state.faults.fail_declares.remove(name);
        }
    }

    /// Nack every publish while set.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().faults.fail_publishes = fail;
    }

    /// Fail every ack, nack and reject while set.
    pub fn fail_acks(&self, fail: bool) {
        self.lock().faults.fail_acks = fail;
    }

    /// Apply (or lift) publish backpressure. Blocked publishes stay pending
    /// until the flag is cleared.
    pub fn set_blocked(&self, blocked: bool) {
        self.shared.blocked.send_replace(blocked);
    }

    /// Drop every open connection, as a broker restart or network partition
    /// would.
    pub fn disconnect_all(&self) {
        // ---
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, BusError::Connection("connection reset by broker".into()));
        }
    }

    /// Close every open channel while leaving connections up.
    pub fn close_all_channels(&self) {
        // ---
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id, BusError::Channel("channel closed by broker".into()));
        }
    }

    // --- inspection

    /// Every broker-facing call so far, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// `host:port` of every connection attempt, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.lock().attempts.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in `queue` (not counting unacknowledged ones).
    pub fn queue_depth(&self, queue: &str) -> usize {
        // ---
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Delivered messages not yet acknowledged, across all channels.
    pub fn unacked_count(&self) -> usize {
        // ---
        self.lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    /// `(source, destination, key)` of every binding.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        // ---
        self.lock()
            .bindings
            .iter()
            .map(|b| (b.source.clone(), b.destination.clone(), b.key.clone()))
            .collect()
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        // ---
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, id: u64) -> Result<()> {
        // ---
        if self.channels.contains_key(&id) {
            Ok(())
        } else {
            Err(BusError::Channel(format!("channel {id} is closed")))
        }
    }

    fn close_connection(&mut self, id: u64, reason: BusError) {
        // ---
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id, reason.clone());
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.def.exclusive && q.owner == id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }

        connection.closed_tx.send_replace(Some(reason));
    }

    fn close_channel(&mut self, id: u64, reason: BusError) {
        // ---
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        // Requeue unacked messages at the head, oldest first.
        for (_, (queue, mut message)) in channel.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }

        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|c| c.channel != id);
            if queue.def.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }

        channel.closed_tx.send_replace(Some(reason));

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        // ---
        self.queues.remove(name);
        self.bindings.retain(|b| !(b.to_queue && b.destination == name));
    }

    fn route(&self, exchange: &str, routing_key: &str, visited: &mut HashSet<String>) -> Vec<String> {
        // ---
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        if !visited.insert(exchange.to_string()) {
            return Vec::new();
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Vec::new();
        };

        let mut queues = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.source == exchange) {
            let matched = match def.kind {
                ExchangeKind::Direct => binding.key == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.key, routing_key),
            };
            if !matched {
                continue;
            }
            if binding.to_queue {
                queues.push(binding.destination.clone());
            } else {
                queues.extend(self.route(&binding.destination, routing_key, visited));
            }
        }

        if queues.is_empty() {
            if let Some(alternate) = &def.alternate {
                queues.extend(self.route(alternate, routing_key, visited));
            }
        }

        queues.sort();
        queues.dedup();
        queues
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        // ---
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        q.ready.push_back(message);
        if let Some(max) = q.def.max_length {
            while q.ready.len() > max as usize {
                q.ready.pop_front();
            }
        }
        self.dispatch(queue);
    }

    fn dispatch(&mut self, queue: &str) {
        // ---
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            // Pick the next consumer whose channel has prefetch capacity.
            let count = q.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (q.next_consumer + offset) % count;
                let consumer = &q.consumers[index];
                let Some(channel) = self.channels.get(&consumer.channel) else {
                    continue;
                };
                if consumer.no_ack
                    || channel.prefetch == 0
                    || channel.unacked.len() < channel.prefetch as usize
                {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                return;
            };

            q.next_consumer = (index + 1) % count;
            let Some(message) = q.ready.pop_front() else {
                return;
            };
            let consumer_channel = q.consumers[index].channel;
            let no_ack = q.consumers[index].no_ack;
            let tx = q.consumers[index].tx.clone();

            let Some(channel) = self.channels.get_mut(&consumer_channel) else {
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;

            let delivery = Delivery {
                tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                content: message.content.clone(),
                properties: message.properties.clone(),
            };

            match tx.try_send(delivery) {
                Ok(()) => {
                    if !no_ack {
                        channel.unacked.insert(tag, (queue.to_string(), message));
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if let Some(q) = self.queues.get_mut(queue) {
                        q.ready.push_front(message);
                    }
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if let Some(q) = self.queues.get_mut(queue) {
                        q.ready.push_front(message);
                        q.consumers.retain(|c| c.channel != consumer_channel || !c.tx.is_closed());
                    }
                }
            }
        }
    }

    fn settle(&mut self, channel_id: u64, tag: u64, multiple: bool) -> Result<Vec<(String, StoredMessage)>> {
        // ---
        if self.faults.fail_acks {
            return Err(BusError::Ack(format!("broker refused settling tag {tag}")));
        }

        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| BusError::Channel(format!("channel {channel_id} is closed")))?;

        if !channel.unacked.contains_key(&tag) {
            return Err(BusError::Ack(format!("unknown delivery tag {tag}")));
        }

        let tags: Vec<u64> = if multiple {
            channel.unacked.range(..=tag).map(|(t, _)| *t).collect()
        } else {
            vec![tag]
        };

        let settled = tags
            .into_iter()
            .filter_map(|t| channel.unacked.remove(&t))
            .collect();
        Ok(settled)
    }

    fn redispatch_all(&mut self) {
        // ---
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }
}

/// Topic pattern matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectionPtr> {
        // ---
        let mut state = self.lock();
        state.attempts.push(format!("{}:{}", endpoint.host, endpoint.port));

        if state.faults.fail_connects > 0 {
            state.faults.fail_connects -= 1;
            return Err(BusError::Connection(format!("connection to {} refused", endpoint.host)));
        }
        if state.faults.unreachable.contains(&endpoint.host) {
            return Err(BusError::Connection(format!("{} is unreachable", endpoint.host)));
        }

        let id = state.next_id();
        let (closed_tx, closed_rx) = watch::channel(None);
        state.connections.insert(id, ConnectionState { closed_tx });
        drop(state);

        log_debug!("[memory] connection {id} opened to {}", endpoint.uri);

        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
            closed_rx,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    closed_rx: watch::Receiver<Option<BusError>>,
}

async fn wait_closed(mut rx: watch::Receiver<Option<BusError>>) -> BusError {
    // ---
    match rx.wait_for(|reason| reason.is_some()).await {
        Ok(reason) => reason
            .clone()
            .unwrap_or_else(|| BusError::Connection("closed".into())),
        Err(_) => BusError::Connection("broker dropped".into()),
    }
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    // ---
    async fn create_channel(&self, confirm: bool) -> Result<ChannelPtr> {
        // ---
        let mut state = self.shared.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BusError::Connection(format!("connection {} is closed", self.id)));
        }

        let id = state.next_id();
        let (closed_tx, closed_rx) = watch::channel(None);
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_tag: 0,
                prefetch: 0,
                unacked: BTreeMap::new(),
                closed_tx,
            },
        );

        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
            confirm,
            closed_rx,
        }))
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.shared
            .lock()
            .close_connection(self.id, BusError::Closed(format!("connection {}", self.id)));
        Ok(())
    }

    async fn closed(&self) -> BusError {
        wait_closed(self.closed_rx.clone()).await
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    confirm: bool,
    closed_rx: watch::Receiver<Option<BusError>>,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, State>> {
        // ---
        let state = self.shared.lock();
        state.ensure_channel(self.id)?;
        Ok(state)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    // ---
    async fn declare_exchange(&self, def: &ExchangeDef) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::DeclareExchange(def.name.clone()));

        if state.faults.fail_declares.contains(&def.name) {
            return Err(BusError::Declaration {
                entity: format!("exchange '{}'", def.name),
                reason: "access refused".into(),
            });
        }
        if let Some(existing) = state.exchanges.get(&def.name) {
            if existing.kind != def.kind {
                return Err(BusError::Declaration {
                    entity: format!("exchange '{}'", def.name),
                    reason: format!(
                        "inequivalent type: existing {}, requested {}",
                        existing.kind.as_str(),
                        def.kind.as_str()
                    ),
                });
            }
            return Ok(());
        }
        state.exchanges.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn check_exchange(&self, name: &str) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::CheckExchange(name.to_string()));

        let known = state.exchanges.contains_key(name) && !state.faults.fail_declares.contains(name);
        if name.is_empty() || known {
            return Ok(());
        }
        let err = BusError::NotFound(format!("exchange '{name}'"));
        state.close_channel(self.id, err.clone());
        Err(err)
    }

    async fn declare_queue(&self, def: &QueueDef) -> Result<u32> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::DeclareQueue(def.name.clone()));

        if state.faults.fail_declares.contains(&def.name) {
            return Err(BusError::Declaration {
                entity: format!("queue '{}'", def.name),
                reason: "access refused".into(),
            });
        }

        let owner = state.channels.get(&self.id).map(|c| c.connection).unwrap_or(0);
        let queue = state.queues.entry(def.name.clone()).or_insert_with(|| QueueState {
            def: def.clone(),
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            had_consumer: false,
        });
        Ok(queue.ready.len() as u32)
    }

    async fn check_queue(&self, name: &str) -> Result<u32> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::CheckQueue(name.to_string()));

        let found = if state.faults.fail_declares.contains(name) {
            None
        } else {
            state.queues.get(name).map(|q| q.ready.len() as u32)
        };
        match found {
            Some(count) => Ok(count),
            None => {
                let err = BusError::NotFound(format!("queue '{name}'"));
                state.close_channel(self.id, err.clone());
                Err(err)
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            key: routing_key.to_string(),
        });

        if !state.queues.contains_key(queue) {
            return Err(BusError::NotFound(format!("queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::NotFound(format!("exchange '{exchange}'")));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.to_queue && b.source == exchange && b.destination == queue && b.key == routing_key);
        if !exists {
            state.bindings.push(BindingRow {
                source: exchange.to_string(),
                destination: queue.to_string(),
                key: routing_key.to_string(),
                to_queue: true,
            });
        }
        Ok(())
    }

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::BindExchange {
            destination: destination.to_string(),
            source: source.to_string(),
            key: routing_key.to_string(),
        });

        for name in [destination, source] {
            if !state.exchanges.contains_key(name) {
                return Err(BusError::NotFound(format!("exchange '{name}'")));
            }
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| !b.to_queue && b.source == source && b.destination == destination && b.key == routing_key);
        if !exists {
            state.bindings.push(BindingRow {
                source: source.to_string(),
                destination: destination.to_string(),
                key: routing_key.to_string(),
                to_queue: false,
            });
        }
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Qos(prefetch));
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, params: ConsumeParams) -> Result<mpsc::Receiver<Delivery>> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Consume {
            queue: queue.to_string(),
            consumer_tag: params.consumer_tag.clone(),
        });

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::NotFound(format!("queue '{queue}'")))?;

        if params.exclusive && !q.consumers.is_empty() {
            return Err(BusError::Channel(format!("queue '{queue}' already has consumers")));
        }

        q.consumers.push(Consumer {
            channel: self.id,
            tag: params.consumer_tag,
            no_ack: params.no_ack,
            tx,
        });
        q.had_consumer = true;
        state.dispatch(queue);
        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Cancel(consumer_tag.to_string()));
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<()> {
        // ---
        // Backpressure: wait for the write side to drain.
        let mut blocked = self.shared.blocked.subscribe();
        let _ = blocked.wait_for(|b| !*b).await;

        let mut state = self.state()?;
        state.calls.push(BrokerCall::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            let err = BusError::NotFound(format!("exchange '{exchange}'"));
            state.close_channel(self.id, err.clone());
            return Err(err);
        }
        if self.confirm && state.faults.fail_publishes {
            return Err(BusError::PublishRejected {
                exchange: exchange.to_string(),
                reason: "nacked by broker".into(),
            });
        }

        let targets = state.route(exchange, routing_key, &mut HashSet::new());
        for queue in targets {
            state.enqueue(
                &queue,
                StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    content: content.clone(),
                    properties: properties.clone(),
                    redelivered: false,
                },
            );
        }
        Ok(())
    }

    async fn ack(&self, tag: u64, multiple: bool) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Ack { tag, multiple });
        state.settle(self.id, tag, multiple)?;
        state.redispatch_all();
        Ok(())
    }

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Nack {
            tag,
            multiple,
            requeue,
        });
        let settled = state.settle(self.id, tag, multiple)?;
        if requeue {
            for (queue, mut message) in settled.into_iter().rev() {
                if let Some(q) = state.queues.get_mut(&queue) {
                    message.redelivered = true;
                    q.ready.push_front(message);
                }
            }
        } else {
            dead_letter(&mut state, settled);
        }
        state.redispatch_all();
        Ok(())
    }

    async fn reject(&self, tag: u64, multiple: bool) -> Result<()> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Reject { tag, multiple });
        let settled = state.settle(self.id, tag, multiple)?;
        dead_letter(&mut state, settled);
        state.redispatch_all();
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        // ---
        let mut state = self.state()?;
        state.calls.push(BrokerCall::Purge(queue.to_string()));
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::NotFound(format!("queue '{queue}'")))?;
        let purged = q.ready.len() as u32;
        q.ready.clear();
        Ok(purged)
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.shared
            .lock()
            .close_channel(self.id, BusError::Channel(format!("channel {} closed", self.id)));
        Ok(())
    }

    async fn closed(&self) -> BusError {
        wait_closed(self.closed_rx.clone()).await
    }
}

fn dead_letter(state: &mut State, settled: Vec<(String, StoredMessage)>) {
    // ---
    for (queue, message) in settled {
        let Some(exchange) = state.queues.get(&queue).and_then(|q| q.def.dead_letter.clone()) else {
            continue;
        };
        let targets = state.route(&exchange, &message.routing_key, &mut HashSet::new());
        for target in targets {
            state.enqueue(&target, message.clone());
        }
    }
}

/// Create a broker pointer backed by `broker`.
pub fn create_memory_broker(broker: &MemoryBroker) -> BrokerPtr {
    // ---
    log_info!("[memory] using in-memory broker");
    Arc::new(broker.clone())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn endpoint() -> Endpoint {
        // ---
        Endpoint {
            host: "localhost".into(),
            port: 5672,
            uri: "amqp://localhost:5672".into(),
        }
    }

    async fn open(broker: &MemoryBroker) -> (ConnectionPtr, ChannelPtr) {
        // ---
        let connection = create_memory_broker(broker).connect(&endpoint()).await.unwrap();
        let channel = connection.create_channel(true).await.unwrap();
        (connection, channel)
    }

    fn queue_def(name: &str) -> QueueDef {
        // ---
        QueueDef {
            name: name.into(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            dead_letter: None,
            max_length: None,
        }
    }

    fn exchange_def(name: &str, kind: ExchangeKind) -> ExchangeDef {
        // ---
        ExchangeDef {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            alternate: None,
        }
    }

    #[test]
    fn test_topic_matching() {
        // ---
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("#", ""));
        assert!(!topic_matches("a.b", "a.c"));
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;

        channel.declare_exchange(&exchange_def("x", ExchangeKind::Direct)).await.unwrap();
        channel.declare_queue(&queue_def("q")).await.unwrap();
        channel.bind_queue("q", "x", "key").await.unwrap();

        let mut rx = channel
            .consume(
                "q",
                ConsumeParams {
                    consumer_tag: "c1".into(),
                    no_ack: false,
                    exclusive: false,
                },
            )
            .await
            .unwrap();

        channel
            .publish("x", "key", Bytes::from_static(b"hi"), &MessageProperties::default())
            .await
            .unwrap();
        channel
            .publish("x", "other", Bytes::from_static(b"lost"), &MessageProperties::default())
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.tag, 1);
        assert_eq!(delivery.content, Bytes::from_static(b"hi"));
        assert_eq!(broker.unacked_count(), 1);

        channel.ack(delivery.tag, true).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert!(channel.ack(delivery.tag, false).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_check_closes_channel() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;

        let err = channel.check_queue("missing").await.unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)));
        assert!(matches!(channel.closed().await, BusError::NotFound(_)));
        assert!(channel.declare_queue(&queue_def("q")).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked() {
        // ---
        let broker = MemoryBroker::new();
        let (conn, channel) = open(&broker).await;
        channel.declare_queue(&queue_def("q")).await.unwrap();

        let mut rx = channel
            .consume(
                "q",
                ConsumeParams {
                    consumer_tag: "c1".into(),
                    no_ack: false,
                    exclusive: false,
                },
            )
            .await
            .unwrap();
        channel
            .publish("", "q", Bytes::from_static(b"m"), &MessageProperties::default())
            .await
            .unwrap();
        rx.recv().await.unwrap();

        broker.disconnect_all();

        assert!(matches!(conn.closed().await, BusError::Connection(_)));
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(rx.recv().await.is_none());

        let (_conn, channel) = open(&broker).await;
        let mut rx = channel
            .consume(
                "q",
                ConsumeParams {
                    consumer_tag: "c2".into(),
                    no_ack: true,
                    exclusive: false,
                },
            )
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        assert!(delivery.redelivered);
        assert_eq!(delivery.tag, 1);
    }

    #[tokio::test]
    async fn test_reject_dead_letters() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;

        channel.declare_exchange(&exchange_def("dlx", ExchangeKind::Fanout)).await.unwrap();
        channel.declare_queue(&queue_def("dead")).await.unwrap();
        channel.bind_queue("dead", "dlx", "").await.unwrap();

        let mut def = queue_def("work");
        def.dead_letter = Some("dlx".into());
        channel.declare_queue(&def).await.unwrap();

        let mut rx = channel
            .consume(
                "work",
                ConsumeParams {
                    consumer_tag: "c".into(),
                    no_ack: false,
                    exclusive: false,
                },
            )
            .await
            .unwrap();
        channel
            .publish("", "work", Bytes::from_static(b"bad"), &MessageProperties::default())
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        channel.reject(delivery.tag, false).await.unwrap();

        assert_eq!(broker.queue_depth("dead"), 1);
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn test_alternate_exchange_receives_unroutable() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;

        channel.declare_exchange(&exchange_def("alt", ExchangeKind::Fanout)).await.unwrap();
        let mut main = exchange_def("main", ExchangeKind::Direct);
        main.alternate = Some("alt".into());
        channel.declare_exchange(&main).await.unwrap();
        channel.declare_queue(&queue_def("unrouted")).await.unwrap();
        channel.bind_queue("unrouted", "alt", "").await.unwrap();

        channel
            .publish("main", "nobody", Bytes::from_static(b"m"), &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("unrouted"), 1);
    }
}
