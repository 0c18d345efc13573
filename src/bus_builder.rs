//! Bus builder.
//!
//! Provides a fluent builder API for constructing a [`Bus`] from a
//! connection config, picking the broker implementation and optionally
//! declaring an initial topology.

use crate::{
    // ---
    create_lapin_broker,
    create_memory_broker,
    log_debug,
    BrokerPtr,
    Bus,
    BusError,
    ConnectionConfig,
    MemoryBroker,
    Result,
    TopologyConfig,
};

/// Builder for [`Bus`] instances.
///
/// ```no_run
/// use mom_bus::{BusBuilder, ConnectionConfig, TopologyConfig};
///
/// # async fn example() -> mom_bus::Result<()> {
/// let topology = TopologyConfig::from_json(r#"{ "queues": [{ "name": "jobs" }] }"#)?;
///
/// let bus = BusBuilder::new(ConnectionConfig::with_uri("main", "amqp://localhost:5672/%2f"))
///     .broker_type("lapin")
///     .topology(topology)
///     .connect(true)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct BusBuilder {
    // ---
    config: ConnectionConfig,
    broker: Option<BrokerPtr>,
    broker_type: Option<String>,
    topology: Option<TopologyConfig>,
    connect: bool,
}

impl BusBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        // ---
        Self {
            config,
            broker: None,
            broker_type: None,
            topology: None,
            connect: false,
        }
    }

    /// Use an already constructed broker. Takes precedence over
    /// [`broker_type`](Self::broker_type).
    pub fn broker(mut self, broker: BrokerPtr) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Select the broker implementation: `"memory"` or `"lapin"`.
    ///
    /// If not specified, lapin is used when compiled in and the in-memory
    /// broker otherwise.
    pub fn broker_type(mut self, flag: impl Into<String>) -> Self {
        self.broker_type = Some(flag.into());
        self
    }

    /// Topology to declare once the bus is built. Implies [`connect`](Self::connect).
    pub fn topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Connect before returning from [`build`](Self::build).
    pub fn connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    /// Build the bus (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The connection config is invalid
    /// - The broker type is unknown or not compiled in
    /// - Connecting or declaring the topology fails
    pub async fn build(self) -> Result<Bus> {
        // ---
        let broker = match (self.broker, self.broker_type.as_deref()) {
            (Some(broker), _) => broker,
            (None, Some("memory")) => create_memory_broker(&MemoryBroker::new()),
            (None, Some("lapin")) => create_lapin_broker()?,
            (None, Some(other)) => {
                return Err(BusError::Config(format!(
                    "unrecognized broker_type: {other}, valid values: memory, lapin"
                )))
            }
            (None, None) => match create_lapin_broker() {
                Ok(broker) => broker,
                Err(_) => create_memory_broker(&MemoryBroker::new()),
            },
        };

        let bus = Bus::new(self.config, broker).await?;
        log_debug!("[bus:{}] built", bus.name());

        if self.connect || self.topology.is_some() {
            bus.connect().await?;
        }
        if let Some(topology) = self.topology {
            bus.configure(topology).await?;
        }
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ConnectionState;

    #[tokio::test]
    async fn test_unknown_broker_type_is_rejected() {
        // ---
        let result = BusBuilder::new(ConnectionConfig::default())
            .broker_type("carrier-pigeon")
            .build()
            .await;
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[tokio::test]
    async fn test_topology_is_declared_on_build() {
        // ---
        let broker = MemoryBroker::new();
        let topology = TopologyConfig::from_json(
            r#"{ "exchanges": [{ "name": "events", "type": "fanout" }], "queues": [{ "name": "jobs" }] }"#,
        )
        .unwrap();

        let bus = BusBuilder::new(ConnectionConfig::default())
            .broker(create_memory_broker(&broker))
            .topology(topology)
            .build()
            .await
            .unwrap();

        assert_eq!(bus.state(), ConnectionState::Connected);
        assert!(broker.has_exchange("events"));
        assert!(broker.has_queue("jobs"));
    }

    #[tokio::test]
    async fn test_build_without_connect_stays_idle() {
        // ---
        let broker = MemoryBroker::new();
        let bus = BusBuilder::new(ConnectionConfig::default())
            .broker(create_memory_broker(&broker))
            .build()
            .await
            .unwrap();

        assert_eq!(bus.state(), ConnectionState::Initializing);
        assert!(broker.connect_attempts().is_empty());
    }
}
