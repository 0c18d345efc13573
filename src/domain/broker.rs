// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the broker-facing contract used by the connection,
//! exchange, queue and topology state machines. It intentionally avoids any
//! reference to a concrete client library: the state machines only ever talk
//! to a [`Broker`], the [`BrokerConnection`]s it hands out, and the
//! [`BrokerChannel`]s those connections open.
//!
//! The broker layer is responsible only for executing individual AMQP-style
//! operations. Higher-level semantics such as retries, deferral while not
//! ready, topology replay and acknowledgement batching are handled by the
//! state machines.
//!
//! Concrete implementations of this interface live under `src/broker/`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{BusError, Result};

/// Exchange routing type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// Broker-level exchange definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDef {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Alternate exchange receiving unroutable messages.
    pub alternate: Option<String>,
}

/// Broker-level queue definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDef {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Dead-letter exchange.
    pub dead_letter: Option<String>,
    pub max_length: Option<u32>,
}

/// Message metadata carried alongside the opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// A message delivered to a consumer.
///
/// `tag` is assigned by the broker per channel and increases monotonically
/// in delivery order.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub content: Bytes,
    pub properties: MessageProperties,
}

/// Consumer registration parameters.
#[derive(Debug, Clone)]
pub struct ConsumeParams {
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Final decision about a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; requeue for redelivery.
    Nack,
    /// Refused; drop (or dead-letter) without requeue.
    Reject,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            Resolution::Ack => "ack",
            Resolution::Nack => "nack",
            Resolution::Reject => "reject",
        }
    }
}

/// Network location of one broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Full connection URI for this host/port combination.
    pub uri: String,
}

/// Factory for broker connections.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---
    /// Open a new connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectionPtr>;
}

/// One physical broker connection.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    // ---
    /// Open a channel. With `confirm` set, publishes resolve only once the
    /// broker confirms them.
    async fn create_channel(&self, confirm: bool) -> Result<ChannelPtr>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<()>;

    /// Resolves once the connection is gone, with the reason.
    async fn closed(&self) -> BusError;
}

/// One logical channel on a broker connection.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    // ---
    async fn declare_exchange(&self, def: &ExchangeDef) -> Result<()>;

    /// Passive declare: fails with [`BusError::NotFound`] if missing.
    async fn check_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue, returning its current message count.
    async fn declare_queue(&self, def: &QueueDef) -> Result<u32>;

    /// Passive declare: fails with [`BusError::NotFound`] if missing.
    async fn check_queue(&self, name: &str) -> Result<u32>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str)
        -> Result<()>;

    /// Set the prefetch limit for consumers on this channel.
    async fn qos(&self, prefetch: u16) -> Result<()>;

    /// Start consuming `queue`; deliveries arrive on the returned receiver
    /// until the consumer is cancelled or the channel closes.
    async fn consume(&self, queue: &str, params: ConsumeParams) -> Result<mpsc::Receiver<Delivery>>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Publish a message. Suspends while the channel applies backpressure and,
    /// on confirm channels, until the broker confirms.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<()>;

    async fn ack(&self, tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    /// Refuse without requeue. `multiple` covers every outstanding tag up to
    /// and including `tag`.
    async fn reject(&self, tag: u64, multiple: bool) -> Result<()>;

    /// Remove all ready messages from `queue`, returning how many were purged.
    async fn purge(&self, queue: &str) -> Result<u32>;

    async fn close(&self) -> Result<()>;

    /// Resolves once the channel is gone, with the reason.
    async fn closed(&self) -> BusError;
}

/// Shared broker pointer.
pub type BrokerPtr = Arc<dyn Broker>;

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn BrokerConnection>;

/// Shared channel pointer.
///
/// `.clone()` is cheap and every clone drives the same broker channel.
pub type ChannelPtr = Arc<dyn BrokerChannel>;
