//! Domain layer public interface.
//!
//! This module defines broker-level abstractions that are independent of any
//! client library, protocol implementation or infrastructure concern.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;

// --- Broker domain re-exports ---

pub use broker::{
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
