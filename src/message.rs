//! Outbound message type.

use std::time::Duration;

use bytes::Bytes;

use crate::domain::MessageProperties;

/// A message to publish on an exchange.
///
/// The payload is opaque bytes; the bus never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub routing_key: String,
    pub content: Bytes,
    pub properties: MessageProperties,
    /// Per-message publish timeout, overriding the exchange default.
    pub timeout: Option<Duration>,
    pub(crate) sequence_no: Option<u64>,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, content: impl Into<Bytes>) -> Self {
        // ---
        Self {
            routing_key: routing_key.into(),
            content: content.into(),
            properties: MessageProperties::default(),
            timeout: None,
            sequence_no: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.properties.persistent = persistent;
        self
    }

    /// Sequence number assigned by the exchange's publish log, if logged.
    pub fn sequence_no(&self) -> Option<u64> {
        self.sequence_no
    }
}
