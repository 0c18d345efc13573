// src/broker/lapin.rs

//! AMQP broker implementation using `lapin`.
//!
//! Maps the domain broker traits one-to-one onto AMQP 0-9-1 methods:
//!
//! - every [`BrokerConnection`] is one `lapin::Connection`,
//! - every [`BrokerChannel`] is one `lapin::Channel`, optionally in confirm
//!   mode,
//! - a consumer is a spawned task forwarding the `lapin::Consumer` stream
//!   into the delivery receiver handed to the caller.
//!
//! ## Closure detection
//!
//! Connection errors are reported by lapin's `on_error` callback. Channel
//! closure (for instance after a failed passive declare) is detected by
//! polling the channel status, so owners waiting on
//! [`BrokerChannel::closed`] notice within [`STATUS_POLL`].
//!
//! ## Error mapping
//!
//! - `NOT_FOUND` becomes [`BusError::NotFound`].
//! - `PRECONDITION_FAILED` and `ACCESS_REFUSED` become
//!   [`BusError::Declaration`] (not transient).
//! - Anything that leaves the channel closed becomes [`BusError::Channel`]
//!   (transient).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        ConfirmSelectOptions,
        ExchangeBindOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::{mpsc, watch};

#[allow(unused_imports)]
use crate::{
    // ---
    domain::{
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
    },
    log_debug,
    log_error,
    log_info,
    log_warn,
    BusError,
    Result,
};

/// How often channels are polled for broker-side closure.
pub const STATUS_POLL: Duration = Duration::from_millis(250);

const CONSUMER_BUFFER: usize = 256;

/// Broker backed by a RabbitMQ (or other AMQP 0-9-1) server.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker {
    // ---
    /// Connection name shown in the broker's management UI.
    connection_name: Option<String>,
}

impl LapinBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait::async_trait]
impl Broker for LapinBroker {
    // ---
    async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectionPtr> {
        // ---
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.as_str().into());
        }

        log_debug!("[lapin] connecting to {}:{}", endpoint.host, endpoint.port);
        let connection = Connection::connect(&endpoint.uri, properties)
            .await
            .map_err(|e| BusError::Connection(format!("amqp: connection to {} failed: {e}", endpoint.host)))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        {
            let closed_tx = Arc::clone(&closed_tx);
            connection.on_error(move |err| {
                log_warn!("[lapin] connection error: {err}");
                closed_tx.send_replace(Some(BusError::Connection(format!("amqp: {err}"))));
            });
        }

        log_info!("[lapin] connected to {}:{}", endpoint.host, endpoint.port);
        Ok(Arc::new(LapinConnection {
            connection,
            closed_tx,
            closed_rx,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    closed_tx: Arc<watch::Sender<Option<BusError>>>,
    closed_rx: watch::Receiver<Option<BusError>>,
}

async fn wait_closed(mut rx: watch::Receiver<Option<BusError>>) -> BusError {
    // ---
    match rx.wait_for(|reason| reason.is_some()).await {
        Ok(reason) => reason
            .clone()
            .unwrap_or_else(|| BusError::Connection("amqp: closed".into())),
        Err(_) => BusError::Connection("amqp: connection dropped".into()),
    }
}

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    // ---
    async fn create_channel(&self, confirm: bool) -> Result<ChannelPtr> {
        // ---
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("amqp: channel creation failed: {e}")))?;

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BusError::Channel(format!("amqp: confirm_select failed: {e}")))?;
        }

        log_debug!("[lapin] channel {} opened (confirm: {confirm})", channel.id());
        let (closed_tx, closed_rx) = watch::channel(None);
        Ok(Arc::new(LapinChannel {
            channel,
            confirm,
            closed_tx,
            closed_rx,
            connection_closed: self.closed_rx.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // ---
        let result = self
            .connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| BusError::Connection(format!("amqp: close failed: {e}")));
        self.closed_tx
            .send_replace(Some(BusError::Closed("amqp connection".into())));
        result
    }

    async fn closed(&self) -> BusError {
        wait_closed(self.closed_rx.clone()).await
    }
}

struct LapinChannel {
    channel: Channel,
    confirm: bool,
    closed_tx: watch::Sender<Option<BusError>>,
    closed_rx: watch::Receiver<Option<BusError>>,
    connection_closed: watch::Receiver<Option<BusError>>,
}

impl LapinChannel {
    /// Translate a lapin error, marking the channel closed when it is gone.
    fn map_error(&self, operation: &str, err: lapin::Error) -> BusError {
        // ---
        let soft = match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(soft) => Some(soft.clone()),
                _ => None,
            },
            _ => None,
        };
        let message = format!("amqp: {operation} failed: {err}");

        let mapped = match soft {
            Some(AMQPSoftError::NOTFOUND) => BusError::NotFound(message),
            Some(AMQPSoftError::PRECONDITIONFAILED) | Some(AMQPSoftError::ACCESSREFUSED) => {
                BusError::Declaration {
                    entity: operation.to_string(),
                    reason: message,
                }
            }
            _ => BusError::Channel(message),
        };

        if !self.channel.status().connected() {
            self.closed_tx.send_replace(Some(mapped.clone()));
        }
        mapped
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    // ---
    async fn declare_exchange(&self, def: &ExchangeDef) -> Result<()> {
        // ---
        let mut arguments = FieldTable::default();
        if let Some(alternate) = &def.alternate {
            arguments.insert(
                "alternate-exchange".into(),
                AMQPValue::LongString(alternate.as_str().into()),
            );
        }
        let options = ExchangeDeclareOptions {
            durable: def.durable,
            auto_delete: def.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(&def.name, exchange_kind(def.kind), options, arguments)
            .await
            .map_err(|e| self.map_error(&format!("exchange '{}' declare", def.name), e))
    }

    async fn check_exchange(&self, name: &str) -> Result<()> {
        // ---
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, lapin::ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| self.map_error(&format!("exchange '{name}' check"), e))
    }

    async fn declare_queue(&self, def: &QueueDef) -> Result<u32> {
        // ---
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &def.dead_letter {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
        }
        if let Some(max_length) = def.max_length {
            arguments.insert("x-max-length".into(), AMQPValue::LongLongInt(i64::from(max_length)));
        }
        let options = QueueDeclareOptions {
            durable: def.durable,
            exclusive: def.exclusive,
            auto_delete: def.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare(&def.name, options, arguments)
            .await
            .map_err(|e| self.map_error(&format!("queue '{}' declare", def.name), e))?;
        Ok(queue.message_count())
    }

    async fn check_queue(&self, name: &str) -> Result<u32> {
        // ---
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| self.map_error(&format!("queue '{name}' check"), e))?;
        Ok(queue.message_count())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(&format!("bind {exchange}->{queue}"), e))
    }

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(&format!("bind {source}->{destination}"), e))
    }

    async fn qos(&self, prefetch: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| self.map_error("qos", e))
    }

    async fn consume(&self, queue: &str, params: ConsumeParams) -> Result<mpsc::Receiver<Delivery>> {
        // ---
        let options = BasicConsumeOptions {
            no_ack: params.no_ack,
            exclusive: params.exclusive,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = self
            .channel
            .basic_consume(queue, &params.consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| self.map_error(&format!("consume '{queue}'"), e))?;

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let tag = params.consumer_tag;
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        if tx.send(to_delivery(delivery)).await.is_err() {
                            break;
                        }
                    }
                    Err(_err) => {
                        log_debug!("[lapin] consumer {tag} stopped: {_err}");
                        break;
                    }
                }
            }
            log_debug!("[lapin] consumer {tag} ended");
        });

        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        // ---
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.map_error(&format!("cancel '{consumer_tag}'"), e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<()> {
        // ---
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &content,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| self.map_error(&format!("publish to '{exchange}'"), e))?;

        if !self.confirm {
            return Ok(());
        }

        match confirm
            .await
            .map_err(|e| self.map_error(&format!("confirm from '{exchange}'"), e))?
        {
            Confirmation::Nack(_) => Err(BusError::PublishRejected {
                exchange: exchange.to_string(),
                reason: "broker nacked the message".into(),
            }),
            _ => Ok(()),
        }
    }

    async fn ack(&self, tag: u64, multiple: bool) -> Result<()> {
        // ---
        self.channel
            .basic_ack(tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| BusError::Ack(format!("amqp: ack {tag} failed: {e}")))
    }

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        // ---
        self.channel
            .basic_nack(tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| BusError::Ack(format!("amqp: nack {tag} failed: {e}")))
    }

    async fn reject(&self, tag: u64, multiple: bool) -> Result<()> {
        // ---
        // basic.reject has no `multiple`; a cumulative reject is a
        // non-requeueing nack.
        let result = if multiple {
            self.channel
                .basic_nack(tag, BasicNackOptions { multiple, requeue: false })
                .await
        } else {
            self.channel
                .basic_reject(tag, BasicRejectOptions { requeue: false })
                .await
        };
        result.map_err(|e| BusError::Ack(format!("amqp: reject {tag} failed: {e}")))
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        // ---
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.map_error(&format!("purge '{queue}'"), e))
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed_tx
            .send_replace(Some(BusError::Channel("amqp: channel closed locally".into())));
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| BusError::Channel(format!("amqp: channel close failed: {e}")))
    }

    async fn closed(&self) -> BusError {
        // ---
        loop {
            if let Some(reason) = self.closed_rx.borrow().clone() {
                return reason;
            }
            if let Some(reason) = self.connection_closed.borrow().clone() {
                return reason;
            }
            if !self.channel.status().connected() {
                return BusError::Channel(format!("amqp: channel {} closed", self.channel.id()));
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    // ---
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    // ---
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &properties.headers {
            headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }
        basic = basic.with_headers(headers);
    }
    basic
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    // ---
    let basic = &delivery.properties;
    let text = |value: &Option<lapin::types::ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    let mut headers = BTreeMap::new();
    if let Some(table) = basic.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
        }
    }

    let properties = MessageProperties {
        content_type: text(basic.content_type()),
        correlation_id: text(basic.correlation_id()),
        message_id: text(basic.message_id()),
        reply_to: text(basic.reply_to()),
        persistent: *basic.delivery_mode() == Some(2),
        headers,
    };

    Delivery {
        tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        content: Bytes::from(delivery.data),
        properties,
    }
}

/// Create a broker pointer that connects to AMQP servers through `lapin`.
pub fn create_lapin_broker() -> Result<BrokerPtr> {
    // ---
    log_info!("[lapin] using AMQP broker");
    Ok(Arc::new(LapinBroker::new()))
}
