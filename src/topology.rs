// src/topology.rs

//! Topology manager.
//!
//! Keeps the definitions of every exchange, queue and binding declared
//! through it and owns the corresponding machines. Declarations are
//! single-flight: concurrent `create_*` calls for the same key share one
//! memoized future and therefore one broker round trip.
//!
//! After every reconnect the whole graph is replayed in order:
//!
//! 1. memoization is cleared,
//! 2. machines destroyed by a close are recreated from their definitions,
//! 3. every machine is checked for the new epoch,
//! 4. every binding is bound again,
//! 5. exchanges are told bindings are back and
//!    [`TopologyEvent::BindingsCompleted`] is broadcast once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{join_all, try_join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[allow(unused_imports)]
use crate::{
    // ---
    connection::{Connection, ConnectionEvent},
    exchange::{Exchange, ExchangeState},
    log_debug,
    log_error,
    log_info,
    log_warn,
    queue::{Queue, QueueState},
    resource::{ChannelResource, ResourceState},
    retry::Backoff,
    BindingOptions,
    BusError,
    ExchangeOptions,
    QueueOptions,
    Result,
    TopologyConfig,
};

/// Notifications broadcast by a [`Topology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// Every binding was replayed after the reconnect that opened `epoch`.
    BindingsCompleted { epoch: u64 },
}

type Memo<T> = Shared<BoxFuture<'static, Result<T>>>;

#[derive(Default)]
struct Registry {
    // ---
    exchange_defs: HashMap<String, ExchangeOptions>,
    queue_defs: HashMap<String, QueueOptions>,
    /// Bindings in declaration order, unique by id.
    bindings: Vec<BindingOptions>,

    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,

    exchange_memo: HashMap<String, Memo<Exchange>>,
    queue_memo: HashMap<String, Memo<Queue>>,
    binding_memo: HashMap<String, Memo<()>>,
}

impl Registry {
    fn clear_memos(&mut self) {
        // ---
        self.exchange_memo.clear();
        self.queue_memo.clear();
        self.binding_memo.clear();
    }
}

/// Registry of exchanges, queues and bindings on one connection.
/// Cheap to clone.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connection: Connection,
    control: Mutex<ChannelResource>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<TopologyEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(watcher) = lock_ignore_poison(&self.watcher).take() {
            watcher.abort();
        }
    }
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Topology {
    /// Create an empty topology on `connection` and start following its
    /// reconnects.
    pub async fn new(connection: &Connection) -> Self {
        // ---
        let control = ChannelResource::new("topology:control", connection, false).await;
        let (events, _) = broadcast::channel(16);

        let inner = Arc::new(Inner {
            connection: connection.clone(),
            control: Mutex::new(control),
            registry: Mutex::new(Registry::default()),
            events,
            watcher: Mutex::new(None),
        });

        let watcher = tokio::spawn(watch_connection(
            Arc::downgrade(&inner),
            connection.events(),
        ));
        *lock_ignore_poison(&inner.watcher) = Some(watcher);

        Self { inner }
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events.subscribe()
    }

    /// The tracked exchange machine named `name`.
    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        lock_ignore_poison(&self.inner.registry).exchanges.get(name).cloned()
    }

    /// The tracked queue machine named `name`.
    pub fn queue(&self, name: &str) -> Option<Queue> {
        lock_ignore_poison(&self.inner.registry).queues.get(name).cloned()
    }

    /// Binding definitions in declaration order.
    pub fn bindings(&self) -> Vec<BindingOptions> {
        lock_ignore_poison(&self.inner.registry).bindings.clone()
    }

    /// Declare (or with `check`, verify) an exchange and track it.
    ///
    /// Concurrent calls for the same name share one declaration. A failed
    /// declaration forgets the exchange so a later call starts over.
    pub async fn create_exchange(&self, options: ExchangeOptions) -> Result<Exchange> {
        // ---
        let memo = {
            let mut registry = lock_ignore_poison(&self.inner.registry);
            match registry.exchange_memo.get(&options.name) {
                Some(memo) => memo.clone(),
                None => {
                    let name = options.name.clone();
                    registry.exchange_defs.insert(name.clone(), options.clone());
                    let memo = declare_exchange(Arc::clone(&self.inner), options)
                        .boxed()
                        .shared();
                    registry.exchange_memo.insert(name, memo.clone());
                    memo
                }
            }
        };
        memo.await
    }

    /// Declare (or with `check`, verify) a queue and track it.
    pub async fn create_queue(&self, options: QueueOptions) -> Result<Queue> {
        // ---
        let memo = {
            let mut registry = lock_ignore_poison(&self.inner.registry);
            match registry.queue_memo.get(&options.name) {
                Some(memo) => memo.clone(),
                None => {
                    let name = options.name.clone();
                    registry.queue_defs.insert(name.clone(), options.clone());
                    let memo = declare_queue(Arc::clone(&self.inner), options).boxed().shared();
                    registry.queue_memo.insert(name, memo.clone());
                    memo
                }
            }
        };
        memo.await
    }

    /// Bind `source` to `target`, once per routing key.
    ///
    /// Waits for tracked source and target machines to be defined first.
    pub async fn create_binding(&self, options: BindingOptions) -> Result<()> {
        // ---
        let memo = {
            let mut registry = lock_ignore_poison(&self.inner.registry);
            let id = options.id();
            match registry.binding_memo.get(&id) {
                Some(memo) => memo.clone(),
                None => {
                    match registry.bindings.iter_mut().find(|b| b.id() == id) {
                        Some(existing) => *existing = options.clone(),
                        None => registry.bindings.push(options.clone()),
                    }
                    let memo = declare_binding(Arc::clone(&self.inner), options).boxed().shared();
                    registry.binding_memo.insert(id, memo.clone());
                    memo
                }
            }
        };
        memo.await
    }

    /// The tracked exchange `name`, or a verified reference to an exchange
    /// someone else declared.
    pub async fn connect_exchange(&self, name: &str) -> Result<Exchange> {
        // ---
        let known = lock_ignore_poison(&self.inner.registry)
            .exchange_defs
            .get(name)
            .cloned();
        let options = known.unwrap_or_else(|| ExchangeOptions::new(name).with_check(true));
        self.create_exchange(options).await
    }

    /// The tracked queue `name`, or a verified reference to a queue someone
    /// else declared.
    pub async fn connect_queue(&self, name: &str) -> Result<Queue> {
        // ---
        let known = lock_ignore_poison(&self.inner.registry)
            .queue_defs
            .get(name)
            .cloned();
        let options = known.unwrap_or_else(|| QueueOptions::new(name).with_check(true));
        self.create_queue(options).await
    }

    /// Declare a whole topology: exchanges, then queues, then bindings.
    pub async fn configure(&self, config: TopologyConfig) -> Result<()> {
        // ---
        log_info!(
            "[topology:{}] configuring {} exchanges, {} queues, {} bindings",
            self.inner.connection.name(),
            config.exchanges.len(),
            config.queues.len(),
            config.bindings.len()
        );
        try_join_all(config.exchanges.into_iter().map(|e| self.create_exchange(e))).await?;
        try_join_all(config.queues.into_iter().map(|q| self.create_queue(q))).await?;
        try_join_all(config.bindings.into_iter().map(|b| self.create_binding(b))).await?;
        Ok(())
    }

    /// Forget every definition and destroy the tracked machines.
    pub async fn reset(&self) {
        // ---
        let (exchanges, queues) = {
            let mut registry = lock_ignore_poison(&self.inner.registry);
            let exchanges: Vec<Exchange> = registry.exchanges.drain().map(|(_, e)| e).collect();
            let queues: Vec<Queue> = registry.queues.drain().map(|(_, q)| q).collect();
            *registry = Registry::default();
            (exchanges, queues)
        };

        log_debug!(
            "[topology:{}] reset ({} exchanges, {} queues)",
            self.inner.connection.name(),
            exchanges.len(),
            queues.len()
        );
        join_all(exchanges.iter().map(|e| e.destroy())).await;
        join_all(queues.iter().map(|q| q.destroy())).await;
    }

    /// Destroy every machine and the control channel, and stop following
    /// the connection.
    pub async fn destroy(&self) {
        // ---
        if let Some(watcher) = lock_ignore_poison(&self.inner.watcher).take() {
            watcher.abort();
        }
        self.reset().await;
        let control = lock_ignore_poison(&self.inner.control).clone();
        control.destroy().await;
    }
}

async fn declare_exchange(inner: Arc<Inner>, options: ExchangeOptions) -> Result<Exchange> {
    // ---
    let name = options.name.clone();
    let live = lock_ignore_poison(&inner.registry)
        .exchanges
        .get(&name)
        .filter(|e| e.state() != ExchangeState::Destroyed)
        .cloned();

    let exchange = match live {
        Some(exchange) => exchange,
        None => {
            let exchange = Exchange::new(options, &inner.connection).await;
            lock_ignore_poison(&inner.registry)
                .exchanges
                .insert(name.clone(), exchange.clone());
            exchange
        }
    };

    match exchange.check().await {
        Ok(()) => Ok(exchange),
        Err(err) => {
            log_error!("[topology:{}] exchange '{name}' failed: {err}", inner.connection.name());
            {
                let mut registry = lock_ignore_poison(&inner.registry);
                registry.exchange_memo.remove(&name);
                registry.exchange_defs.remove(&name);
                registry.exchanges.remove(&name);
            }
            exchange.destroy().await;
            Err(err)
        }
    }
}

async fn declare_queue(inner: Arc<Inner>, options: QueueOptions) -> Result<Queue> {
    // ---
    let name = options.name.clone();
    let live = lock_ignore_poison(&inner.registry)
        .queues
        .get(&name)
        .filter(|q| q.state() != QueueState::Destroyed)
        .cloned();

    let queue = match live {
        Some(queue) => queue,
        None => {
            let queue = Queue::new(options, &inner.connection).await;
            lock_ignore_poison(&inner.registry)
                .queues
                .insert(name.clone(), queue.clone());
            queue
        }
    };

    match queue.check().await {
        Ok(()) => Ok(queue),
        Err(err) => {
            log_error!("[topology:{}] queue '{name}' failed: {err}", inner.connection.name());
            {
                let mut registry = lock_ignore_poison(&inner.registry);
                registry.queue_memo.remove(&name);
                registry.queue_defs.remove(&name);
                registry.queues.remove(&name);
            }
            queue.destroy().await;
            Err(err)
        }
    }
}

async fn declare_binding(inner: Arc<Inner>, options: BindingOptions) -> Result<()> {
    // ---
    let (source, target) = {
        let registry = lock_ignore_poison(&inner.registry);
        let source = registry.exchanges.get(&options.source).cloned();
        let target = if options.queue {
            registry.queues.get(&options.target).cloned().map(Endpoint::Queue)
        } else {
            registry.exchanges.get(&options.target).cloned().map(Endpoint::Exchange)
        };
        (source, target)
    };

    let ready = async {
        if let Some(source) = source {
            source.check().await?;
        }
        match target {
            Some(Endpoint::Queue(queue)) => queue.check().await,
            Some(Endpoint::Exchange(exchange)) => exchange.check().await,
            None => Ok(()),
        }
    };

    let id = options.id();
    let result = match ready.await {
        Ok(()) => bind(&inner, &options).await,
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        log_error!("[topology:{}] binding {id} failed: {err}", inner.connection.name());
        let mut registry = lock_ignore_poison(&inner.registry);
        registry.binding_memo.remove(&id);
        registry.bindings.retain(|b| b.id() != id);
    }
    result
}

enum Endpoint {
    Queue(Queue),
    Exchange(Exchange),
}

/// Issue the bind calls on the control channel, retrying while the channel
/// is merely unavailable.
async fn bind(inner: &Inner, options: &BindingOptions) -> Result<()> {
    // ---
    let mut backoff = Backoff::new(inner.connection.config().backoff);
    loop {
        let control = lock_ignore_poison(&inner.control).clone();
        let keys = options.effective_keys();
        let result = control
            .operate("bind", |channel| async move {
                for key in &keys {
                    if options.queue {
                        channel.bind_queue(&options.target, &options.source, key).await?;
                    } else {
                        channel.bind_exchange(&options.target, &options.source, key).await?;
                    }
                }
                Ok(())
            })
            .await;

        match result {
            Err(err) if err.is_transient() => {
                let delay = backoff.next_delay();
                log_warn!(
                    "[topology:{}] bind {} interrupted, retrying in {delay:?}: {err}",
                    inner.connection.name(),
                    options.id()
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

async fn watch_connection(inner: Weak<Inner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    // ---
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_skipped)) => {
                log_warn!("[topology] missed {_skipped} connection events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ConnectionEvent::Reconnected { epoch } => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                replay(&inner, epoch).await;
            }
            ConnectionEvent::Destroyed => break,
            _ => {}
        }
    }
}

/// Rebuild the topology on the connection opened at `epoch`.
async fn replay(inner: &Inner, epoch: u64) {
    // ---
    let name = inner.connection.name();
    log_info!("[topology:{name}] replaying topology (epoch {epoch})");

    let control_gone = lock_ignore_poison(&inner.control).status().state == ResourceState::Destroyed;
    if control_gone {
        let control = ChannelResource::new("topology:control", &inner.connection, false).await;
        *lock_ignore_poison(&inner.control) = control;
    }

    let (exchange_defs, queue_defs, bindings) = {
        let mut registry = lock_ignore_poison(&inner.registry);
        registry.clear_memos();
        (
            registry.exchange_defs.clone(),
            registry.queue_defs.clone(),
            registry.bindings.clone(),
        )
    };

    let mut exchanges = Vec::with_capacity(exchange_defs.len());
    for (key, options) in exchange_defs {
        let live = lock_ignore_poison(&inner.registry)
            .exchanges
            .get(&key)
            .filter(|e| e.state() != ExchangeState::Destroyed)
            .cloned();
        let exchange = match live {
            Some(exchange) => exchange,
            None => {
                log_debug!("[topology:{name}] recreating exchange '{key}'");
                let exchange = Exchange::new(options, &inner.connection).await;
                lock_ignore_poison(&inner.registry)
                    .exchanges
                    .insert(key, exchange.clone());
                exchange
            }
        };
        exchanges.push(exchange);
    }

    let mut queues = Vec::with_capacity(queue_defs.len());
    for (key, options) in queue_defs {
        let live = lock_ignore_poison(&inner.registry)
            .queues
            .get(&key)
            .filter(|q| q.state() != QueueState::Destroyed)
            .cloned();
        let queue = match live {
            Some(queue) => queue,
            None => {
                log_debug!("[topology:{name}] recreating queue '{key}'");
                let queue = Queue::new(options, &inner.connection).await;
                lock_ignore_poison(&inner.registry).queues.insert(key, queue.clone());
                queue
            }
        };
        queues.push(queue);
    }

    let exchange_checks = join_all(exchanges.iter().map(|e| e.check_epoch(epoch)));
    let queue_checks = join_all(queues.iter().map(|q| q.check_epoch(epoch)));
    let (exchange_results, queue_results) = tokio::join!(exchange_checks, queue_checks);

    for (exchange, result) in exchanges.iter().zip(exchange_results) {
        if let Err(_err) = result {
            log_error!("[topology:{name}] exchange '{}' check failed: {_err}", exchange.name());
        }
    }
    for (queue, result) in queues.iter().zip(queue_results) {
        if let Err(_err) = result {
            log_error!("[topology:{name}] queue '{}' check failed: {_err}", queue.name());
        }
    }

    for binding in &bindings {
        if let Err(_err) = bind(inner, binding).await {
            log_error!("[topology:{name}] binding {} failed: {_err}", binding.id());
        }
    }

    join_all(exchanges.iter().map(|e| e.bindings_completed(epoch))).await;
    let _ = inner.events.send(TopologyEvent::BindingsCompleted { epoch });
    log_info!("[topology:{name}] bindings completed (epoch {epoch})");
}

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use super::*;
    use crate::broker::memory::BrokerCall;
    use crate::{create_memory_broker, ConnectionConfig, MemoryBroker, Message};

    async fn connected(broker: &MemoryBroker) -> (Connection, Topology) {
        // ---
        let conn = Connection::new(
            ConnectionConfig::with_servers("test", ["localhost"]),
            create_memory_broker(broker),
        );
        conn.connect().await.unwrap();
        let topology = Topology::new(&conn).await;
        (conn, topology)
    }

    #[tokio::test]
    async fn test_create_exchange_is_single_flight() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        let (a, b) = tokio::join!(
            topology.create_exchange(ExchangeOptions::new("orders")),
            topology.create_exchange(ExchangeOptions::new("orders")),
        );
        a.unwrap();
        b.unwrap();

        let declares = broker
            .calls()
            .iter()
            .filter(|call| matches!(call, BrokerCall::DeclareExchange(name) if name == "orders"))
            .count();
        assert_eq!(declares, 1);
    }

    #[tokio::test]
    async fn test_binding_without_keys_binds_empty_key() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        topology.create_exchange(ExchangeOptions::new("events")).await.unwrap();
        topology.create_queue(QueueOptions::new("audit")).await.unwrap();
        topology
            .create_binding(BindingOptions::queue("events", "audit"))
            .await
            .unwrap();

        assert!(broker.calls().contains(&BrokerCall::BindQueue {
            queue: "audit".into(),
            exchange: "events".into(),
            key: String::new(),
        }));
    }

    #[tokio::test]
    async fn test_binding_binds_each_key() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        topology.create_exchange(ExchangeOptions::new("events")).await.unwrap();
        topology.create_queue(QueueOptions::new("audit")).await.unwrap();
        topology
            .create_binding(BindingOptions::queue("events", "audit").with_keys(["a", "b"]))
            .await
            .unwrap();

        let binds = broker
            .calls()
            .iter()
            .filter(|call| matches!(call, BrokerCall::BindQueue { .. }))
            .count();
        assert_eq!(binds, 2);
    }

    #[tokio::test]
    async fn test_failed_declaration_is_evicted() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        broker.fail_declare("flaky", true);
        let err = topology
            .create_exchange(ExchangeOptions::new("flaky"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(topology.exchange("flaky").is_none());

        broker.fail_declare("flaky", false);
        topology.create_exchange(ExchangeOptions::new("flaky")).await.unwrap();
        assert!(topology.exchange("flaky").is_some());
    }

    #[tokio::test]
    async fn test_connect_exchange_checks_unknown_exchange() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        let err = topology.connect_exchange("missing").await.unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)), "{err:?}");
        assert!(broker
            .calls()
            .contains(&BrokerCall::CheckExchange("missing".into())));
    }

    #[tokio::test]
    async fn test_connect_exchange_reuses_declared() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        topology.create_exchange(ExchangeOptions::new("orders")).await.unwrap();
        let exchange = topology.connect_exchange("orders").await.unwrap();

        assert_eq!(exchange.name(), "orders");
        assert!(!broker
            .calls()
            .contains(&BrokerCall::CheckExchange("orders".into())));
    }

    #[tokio::test]
    async fn test_reconnect_replays_topology() {
        // ---
        let broker = MemoryBroker::new();
        let (conn, topology) = connected(&broker).await;
        let mut events = topology.events();

        topology.create_exchange(ExchangeOptions::new("events")).await.unwrap();
        topology.create_queue(QueueOptions::new("audit")).await.unwrap();
        topology
            .create_binding(BindingOptions::queue("events", "audit").with_keys(["k"]))
            .await
            .unwrap();

        broker.clear_calls();
        broker.disconnect_all();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TopologyEvent::BindingsCompleted { epoch: conn.epoch() });

        let calls = broker.calls();
        let position = |wanted: &BrokerCall| calls.iter().position(|call| call == wanted).unwrap();
        let bind = position(&BrokerCall::BindQueue {
            queue: "audit".into(),
            exchange: "events".into(),
            key: "k".into(),
        });
        assert!(position(&BrokerCall::DeclareExchange("events".into())) < bind);
        assert!(position(&BrokerCall::DeclareQueue("audit".into())) < bind);
    }

    #[tokio::test]
    async fn test_close_then_connect_recreates_machines() {
        // ---
        let broker = MemoryBroker::new();
        let (conn, topology) = connected(&broker).await;
        let mut events = topology.events();

        let before = topology.create_exchange(ExchangeOptions::new("orders")).await.unwrap();
        conn.close().await.unwrap();
        let mut state = before.watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ExchangeState::Destroyed),
        )
        .await
        .unwrap()
        .unwrap();

        conn.connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();

        let after = topology.exchange("orders").unwrap();
        assert_eq!(after.state(), ExchangeState::Ready);
        after.publish(Message::new("key", "body")).await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_declares_everything() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        let config = TopologyConfig::from_json(
            r#"{
                "exchanges": [{ "name": "events", "type": "topic" }],
                "queues": [{ "name": "audit", "queueLimit": 10 }],
                "bindings": [{ "exchange": "events", "target": "audit", "pattern": "order.*" }]
            }"#,
        )
        .unwrap();
        topology.configure(config).await.unwrap();

        assert!(broker.has_exchange("events"));
        assert!(broker.has_queue("audit"));
        assert_eq!(
            broker.bindings(),
            vec![("events".to_string(), "audit".to_string(), "order.*".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reset_forgets_definitions() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, topology) = connected(&broker).await;

        let exchange = topology.create_exchange(ExchangeOptions::new("orders")).await.unwrap();
        topology.reset().await;

        assert!(topology.exchange("orders").is_none());
        assert_eq!(exchange.state(), ExchangeState::Destroyed);
    }
}
