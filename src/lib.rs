//! Resilient message-bus client runtime for AMQP-style brokers.
//!
//! This library keeps a broker connection, the topology declared on it and
//! the acknowledgement state of its consumers consistent across connection
//! and channel loss. It handles reconnect with backoff, topology replay,
//! republishing of unconfirmed messages and batched acknowledgements.
//!
//! The pieces are cooperating state machines, leaf first:
//!
//! - [`Connection`]: one physical broker connection.
//! - [`ChannelResource`]: a lazily (re)acquired channel on it.
//! - [`Exchange`] and [`Queue`]: declared entities with their own channel.
//! - [`Topology`]: the registry that replays everything after a reconnect.
//! - [`Bus`]: the facade tying a connection to its topology.
//!
//! Brokers plug in through the [`Broker`] traits. [`MemoryBroker`] is always
//! available; the `transport_lapin` feature adds a RabbitMQ broker.

// Import all sub modules once...
mod macros;

mod domain;
mod error;
mod retry;

mod config;
mod message;

mod ack_batch;
mod publish_log;

mod broker;

mod connection;
mod exchange;
mod queue;
mod resource;
mod topology;

mod bus;
mod bus_builder;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use bus::Bus;
pub use bus_builder::BusBuilder;

pub use error::{BusError, Result};
pub use retry::{Backoff, BackoffConfig};

pub use config::{BindingOptions, ConnectionConfig, ExchangeOptions, QueueOptions, TopologyConfig};
pub use message::Message;

pub use ack_batch::{AckBatch, AckTarget, TagOps};
pub use publish_log::PublishLog;

pub use connection::{Connection, ConnectionEvent, ConnectionState, Teardown, TeardownPtr};
pub use exchange::{Exchange, ExchangeState};
pub use queue::{handler, Handler, MessageOps, Queue, QueueState, SubscribeOptions};
pub use resource::{ChannelResource, Lease, ResourceState, ResourceStatus};
pub use topology::{Topology, TopologyEvent};

pub use broker::{create_lapin_broker, create_memory_broker, BrokerCall, MemoryBroker};

#[cfg(feature = "transport_lapin")]
pub use broker::LapinBroker;

// --- public re-exports
pub use domain::{
    //
    Broker,
    BrokerChannel,
    BrokerConnection,
    BrokerPtr,
    ChannelPtr,
    ConnectionPtr,
    ConsumeParams,
    Delivery,
    Endpoint,
    ExchangeDef,
    ExchangeKind,
    MessageProperties,
    QueueDef,
    Resolution,
};
