//! Message bus facade.
//!
//! A [`Bus`] pairs one [`Connection`] with the [`Topology`] declared on it
//! and is the single entry point publishers and consumers call into.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{
    // ---
    queue::Handler,
    BindingOptions,
    BrokerPtr,
    Connection,
    ConnectionConfig,
    ConnectionEvent,
    ConnectionState,
    Exchange,
    ExchangeOptions,
    Message,
    Queue,
    QueueOptions,
    Result,
    SubscribeOptions,
    Topology,
    TopologyConfig,
    TopologyEvent,
};

/// Connection plus topology. Cheap to clone; clones share both.
///
/// ```no_run
/// use mom_bus::{create_memory_broker, Bus, ConnectionConfig, ExchangeOptions, MemoryBroker, Message};
///
/// # async fn example() -> mom_bus::Result<()> {
/// let broker = MemoryBroker::new();
/// let bus = Bus::new(ConnectionConfig::default(), create_memory_broker(&broker)).await?;
///
/// bus.connect().await?;
/// bus.create_exchange(ExchangeOptions::new("orders")).await?;
/// bus.publish("orders", Message::new("order.created", "{}")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Connection,
    topology: Topology,
}

impl Bus {
    /// Create a bus over `broker`. Nothing connects until [`connect`](Self::connect).
    pub async fn new(config: ConnectionConfig, broker: BrokerPtr) -> Result<Self> {
        // ---
        config.validate()?;
        let connection = Connection::new(config, broker);
        let topology = Topology::new(&connection).await;

        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                topology,
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.connection.name()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Close the connection. With `reset` the topology forgets every
    /// definition, so the next connect starts from an empty graph.
    pub async fn close(&self, reset: bool) -> Result<()> {
        // ---
        let result = self.inner.connection.close().await;
        if reset {
            self.inner.topology.reset().await;
        }
        result
    }

    /// Tear everything down. The bus cannot be used afterwards.
    pub async fn destroy(&self) {
        // ---
        self.inner.topology.destroy().await;
        self.inner.connection.destroy().await;
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.events()
    }

    pub fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.topology.events()
    }

    pub async fn configure(&self, config: TopologyConfig) -> Result<()> {
        self.inner.topology.configure(config).await
    }

    pub async fn create_exchange(&self, options: ExchangeOptions) -> Result<Exchange> {
        self.inner.topology.create_exchange(options).await
    }

    pub async fn create_queue(&self, options: QueueOptions) -> Result<Queue> {
        self.inner.topology.create_queue(options).await
    }

    pub async fn create_binding(&self, options: BindingOptions) -> Result<()> {
        self.inner.topology.create_binding(options).await
    }

    pub async fn connect_exchange(&self, name: &str) -> Result<Exchange> {
        self.inner.topology.connect_exchange(name).await
    }

    pub async fn connect_queue(&self, name: &str) -> Result<Queue> {
        self.inner.topology.connect_queue(name).await
    }

    /// Publish through the exchange named `exchange`, connecting to it first
    /// if this bus has not declared it.
    pub async fn publish(&self, exchange: &str, message: Message) -> Result<()> {
        // ---
        let exchange = self.inner.topology.connect_exchange(exchange).await?;
        exchange.publish(message).await
    }

    /// Consume from the queue named `queue` with `handler`.
    pub async fn subscribe(&self, queue: &str, handler: Handler, options: SubscribeOptions) -> Result<()> {
        // ---
        let queue = self.inner.topology.connect_queue(queue).await?;
        queue.subscribe(handler, options).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_broker, BusError, MemoryBroker};

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        // ---
        let broker = MemoryBroker::new();
        let config = ConnectionConfig::default().with_ports(Vec::<u16>::new());

        let result = Bus::new(config, create_memory_broker(&broker)).await;
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        // ---
        let broker = MemoryBroker::new();
        let bus = Bus::new(ConnectionConfig::default(), create_memory_broker(&broker))
            .await
            .unwrap();
        bus.connect().await.unwrap();

        let err = bus
            .publish("nowhere", Message::new("key", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_close_with_reset_forgets_topology() {
        // ---
        let broker = MemoryBroker::new();
        let bus = Bus::new(ConnectionConfig::default(), create_memory_broker(&broker))
            .await
            .unwrap();
        bus.connect().await.unwrap();
        bus.create_queue(QueueOptions::new("jobs")).await.unwrap();

        bus.close(true).await.unwrap();

        assert_eq!(bus.state(), ConnectionState::Closed);
        assert!(bus.topology().queue("jobs").is_none());
    }
}
