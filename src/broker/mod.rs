//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Broker` traits. Brokers other than the in-memory one are hidden behind
//! feature flags and exposed only through constructor functions.
//!
//! State machines must not depend on broker-specific types.

pub(crate) mod memory;

#[cfg(feature = "transport_lapin")]
mod lapin;

pub use memory::{create_memory_broker, BrokerCall, MemoryBroker};

#[cfg(feature = "transport_lapin")]
pub use self::lapin::{create_lapin_broker, LapinBroker};

/// Stand-in used when the `transport_lapin` feature is disabled.
#[cfg(not(feature = "transport_lapin"))]
pub fn create_lapin_broker() -> crate::Result<crate::BrokerPtr> {
    Err(crate::BusError::Config(
        "the lapin broker requires the `transport_lapin` feature".into(),
    ))
}
