// src/exchange.rs

//! Exchange state machine.
//!
//! ```text
//! setup -> initializing -> ready <-> reconnecting -> reconnected -> ready
//!                     \-> failed         (any) -> destroyed
//! ```
//!
//! An [`Exchange`] declares (or, with `check`, verifies) its exchange on its
//! own channel and publishes through it. Every publish is recorded in the
//! exchange's [`PublishLog`] until the broker confirms it.
//!
//! When the channel is lost the machine re-defines the exchange on a fresh
//! channel. If the connection itself cycled (new epoch) it then waits in
//! `reconnected` until topology reports that bindings for that epoch are
//! back, so republished messages are routed; if only the channel cycled it
//! republishes straight away. Callers whose publishes were cut off by the
//! outage keep waiting and are answered by the republish.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

#[allow(unused_imports)]
use crate::{
    // ---
    connection::Connection,
    domain::{ChannelPtr, ExchangeDef},
    log_debug,
    log_error,
    log_info,
    log_warn,
    resource::{ChannelResource, Lease, ResourceState, ResourceStatus},
    retry::Backoff,
    BusError,
    ExchangeOptions,
    Message,
    PublishLog,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    Setup,
    Initializing,
    Ready,
    Reconnecting,
    Reconnected,
    Failed,
    Destroyed,
}

type PublishResp = oneshot::Sender<Result<()>>;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        message: Message,
        resp: PublishResp,
    },
    Check {
        min_epoch: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    BindingsCompleted {
        epoch: u64,
    },
    /// Drop publishes whose callers stopped waiting.
    Sweep,
    Unconfirmed {
        resp: oneshot::Sender<usize>,
    },
    Destroy {
        resp: oneshot::Sender<()>,
    },
}

enum Report {
    //
    Defined {
        run: u64,
        result: Result<Lease>,
    },
    Published {
        round: u64,
        sequence: u64,
        result: Result<()>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Report(Report),
    Resource(ResourceStatus),
    Stop,
}

/// Handle to an exchange state machine. Cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    options: ExchangeOptions,
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ExchangeState>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Exchange {
    /// Create the machine and start defining the exchange on a dedicated
    /// channel of `connection`.
    pub async fn new(options: ExchangeOptions, connection: &Connection) -> Self {
        // ---
        let name = options.name.clone();
        let resource = ChannelResource::new(
            format!("exchange:{name}"),
            connection,
            connection.config().publish_confirms,
        )
        .await;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ExchangeState::Setup);

        let mut actor = Actor {
            name,
            definition: options.definition(),
            check: options.check,
            status_rx: resource.watch(),
            resource,
            resource_gone: false,
            backoff: Backoff::new(connection.config().backoff),
            state: ExchangeState::Setup,
            state_tx,
            lease: None,
            ready_epoch: 0,
            completed_epoch: 0,
            failure: None,
            log: PublishLog::new(),
            round: 0,
            run: 0,
            responders: HashMap::new(),
            deferred: VecDeque::new(),
            checks: Vec::new(),
            cmd_rx,
            report_tx,
            report_rx,
        };
        actor.start_define(ExchangeState::Initializing, Duration::ZERO);
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(Inner {
                options,
                cmd_tx,
                state_rx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ExchangeState {
        *self.inner.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ExchangeState> {
        self.inner.state_rx.clone()
    }

    fn destroyed(&self) -> BusError {
        BusError::Destroyed(format!("exchange '{}'", self.inner.options.name))
    }

    /// Resolve once the exchange is defined (`ready` or `reconnected`).
    pub async fn check(&self) -> Result<()> {
        self.check_epoch(0).await
    }

    /// Like [`check`](Self::check), but only a channel from connection
    /// epoch `min_epoch` or later counts as defined.
    pub(crate) async fn check_epoch(&self, min_epoch: u64) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Cmd::Check { min_epoch, resp: tx })
            .await
            .map_err(|_| self.destroyed())?;
        rx.await.map_err(|_| self.destroyed())?
    }

    /// Publish `message`, resolving when the broker confirms it.
    ///
    /// The message's own timeout applies, falling back to the exchange's
    /// `publish_timeout`. A timed out publish is abandoned: it is never
    /// republished.
    pub async fn publish(&self, message: Message) -> Result<()> {
        // ---
        let timeout = message.timeout.or(self.inner.options.publish_timeout);
        let (tx, rx) = oneshot::channel();

        self.inner
            .cmd_tx
            .send(Cmd::Publish { message, resp: tx })
            .await
            .map_err(|_| self.destroyed())?;

        let Some(limit) = timeout else {
            return rx.await.map_err(|_| self.destroyed())?;
        };

        match tokio::time::timeout(limit, rx).await {
            Ok(result) => result.map_err(|_| self.destroyed())?,
            Err(_) => {
                log_warn!(
                    "[exchange:{}] publish timed out after {limit:?}",
                    self.inner.options.name
                );
                let _ = self.inner.cmd_tx.try_send(Cmd::Sweep);
                Err(BusError::PublishTimeout {
                    exchange: self.inner.options.name.clone(),
                    timeout: limit,
                })
            }
        }
    }

    /// Number of publishes awaiting broker confirmation.
    pub async fn unconfirmed(&self) -> usize {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Cmd::Unconfirmed { resp: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Topology has replayed every binding for `epoch`.
    pub async fn bindings_completed(&self, epoch: u64) {
        let _ = self.inner.cmd_tx.send(Cmd::BindingsCompleted { epoch }).await;
    }

    /// Stop the machine and close its channel.
    pub async fn destroy(&self) {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Cmd::Destroy { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Background actor that owns the exchange state.
struct Actor {
    // ---
    name: String,
    definition: ExchangeDef,
    check: bool,
    resource: ChannelResource,
    status_rx: watch::Receiver<ResourceStatus>,
    resource_gone: bool,
    backoff: Backoff,

    state: ExchangeState,
    state_tx: watch::Sender<ExchangeState>,
    lease: Option<Lease>,
    /// Connection epoch of the last `ready` channel.
    ready_epoch: u64,
    /// Highest epoch topology reported bindings for.
    completed_epoch: u64,
    failure: Option<BusError>,

    log: PublishLog,
    /// Bumped on every log reset; reports from older rounds are stale.
    round: u64,
    /// Bumped on every define; reports from older runs are stale.
    run: u64,
    responders: HashMap<u64, PublishResp>,
    deferred: VecDeque<(Message, PublishResp)>,
    checks: Vec<(u64, oneshot::Sender<Result<()>>)>,

    cmd_rx: mpsc::Receiver<Cmd>,
    report_tx: mpsc::UnboundedSender<Report>,
    report_rx: mpsc::UnboundedReceiver<Report>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        loop {
            match self.next_step().await {
                ActorStep::Cmd(Cmd::Destroy { resp }) => {
                    self.shutdown(BusError::Destroyed(format!("exchange '{}'", self.name)))
                        .await;
                    let _ = resp.send(());
                    break;
                }
                ActorStep::Cmd(cmd) => self.handle_cmd(cmd),
                ActorStep::Report(report) => self.handle_report(report),
                ActorStep::Resource(status) => {
                    if status.state == ResourceState::Destroyed {
                        log_debug!("[exchange:{}] channel destroyed", self.name);
                        self.shutdown(BusError::Destroyed(format!("exchange '{}'", self.name)))
                            .await;
                        break;
                    }
                    self.on_resource(status);
                }
                ActorStep::Stop => {
                    self.shutdown(BusError::Destroyed(format!("exchange '{}'", self.name)))
                        .await;
                    break;
                }
            }
        }
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => ActorStep::Cmd(cmd),
                None => ActorStep::Stop,
            },
            Some(report) = self.report_rx.recv() => ActorStep::Report(report),
            changed = self.status_rx.changed(), if !self.resource_gone => match changed {
                Ok(()) => ActorStep::Resource(*self.status_rx.borrow_and_update()),
                Err(_) => {
                    self.resource_gone = true;
                    ActorStep::Resource(ResourceStatus {
                        state: ResourceState::Destroyed,
                        generation: 0,
                    })
                }
            },
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Publish { message, resp } => self.on_publish(message, resp),
            Cmd::Check { min_epoch, resp } => match self.state {
                ExchangeState::Ready | ExchangeState::Reconnected if self.defined_since(min_epoch) => {
                    let _ = resp.send(Ok(()));
                }
                ExchangeState::Failed => {
                    let _ = resp.send(Err(self.failure_error()));
                }
                ExchangeState::Destroyed => {
                    let _ = resp.send(Err(BusError::Destroyed(format!("exchange '{}'", self.name))));
                }
                _ => self.checks.push((min_epoch, resp)),
            },
            Cmd::BindingsCompleted { epoch } => {
                self.completed_epoch = self.completed_epoch.max(epoch);
                if self.state == ExchangeState::Reconnected {
                    self.maybe_republish();
                }
            }
            Cmd::Sweep => self.sweep(),
            Cmd::Unconfirmed { resp } => {
                let _ = resp.send(self.log.count());
            }
            Cmd::Destroy { resp } => {
                // Handled in run().
                let _ = resp.send(());
            }
        }
    }

    fn handle_report(&mut self, report: Report) {
        // ---
        match report {
            Report::Defined { run, result } => {
                if run != self.run {
                    return;
                }
                match result {
                    Ok(lease) => self.on_defined(lease),
                    Err(err) if err.is_transient() => {
                        let delay = self.backoff.next_delay();
                        log_warn!("[exchange:{}] define interrupted, retrying in {delay:?}: {err}", self.name);
                        self.start_define(self.state, delay);
                    }
                    Err(err) => self.on_failed(err),
                }
            }
            Report::Published {
                round,
                sequence,
                result,
            } => {
                if round != self.round {
                    return;
                }
                match result {
                    Ok(()) => {
                        self.log.remove(sequence);
                        if let Some(resp) = self.responders.remove(&sequence) {
                            let _ = resp.send(Ok(()));
                        }
                    }
                    // The channel went away; the entry stays logged and is
                    // republished once the exchange is back.
                    Err(err) if err.is_transient() => {
                        log_debug!("[exchange:{}] publish {sequence} interrupted: {err}", self.name);
                    }
                    Err(err) => {
                        log_warn!("[exchange:{}] publish {sequence} failed: {err}", self.name);
                        self.log.remove(sequence);
                        if let Some(resp) = self.responders.remove(&sequence) {
                            let _ = resp.send(Err(err));
                        }
                    }
                }
            }
        }
    }

    fn on_resource(&mut self, status: ResourceStatus) {
        // ---
        let Some(lease) = &self.lease else {
            return;
        };
        let ours = status.generation == lease.generation;
        let settled = matches!(self.state, ExchangeState::Ready | ExchangeState::Reconnected);

        if ours && settled && status.state == ResourceState::Released {
            log_info!("[exchange:{}] channel released, reconnecting", self.name);
            self.lease = None;
            self.start_define(ExchangeState::Reconnecting, Duration::ZERO);
        }
    }

    fn defined_since(&self, min_epoch: u64) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.epoch >= min_epoch)
    }

    fn set_state(&mut self, state: ExchangeState) {
        // ---
        if self.state != state {
            log_debug!("[exchange:{}] {:?} -> {:?}", self.name, self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn failure_error(&self) -> BusError {
        // ---
        self.failure.clone().unwrap_or_else(|| BusError::Declaration {
            entity: format!("exchange '{}'", self.name),
            reason: "definition failed".into(),
        })
    }

    fn start_define(&mut self, state: ExchangeState, delay: Duration) {
        // ---
        self.run += 1;
        self.set_state(state);

        let resource = self.resource.clone();
        let definition = self.definition.clone();
        let check = self.check;
        let report = self.report_tx.clone();
        let run = self.run;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = async {
                let lease = resource.get(true).await?;
                if check {
                    lease.channel.check_exchange(&definition.name).await?;
                } else {
                    lease.channel.declare_exchange(&definition).await?;
                }
                Ok::<_, BusError>(lease)
            }
            .await;
            let _ = report.send(Report::Defined { run, result });
        });
    }

    fn on_defined(&mut self, lease: Lease) {
        // ---
        self.backoff.reset();
        let epoch = lease.epoch;
        self.lease = Some(lease);

        let (settled, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.checks)
            .into_iter()
            .partition(|(min_epoch, _)| *min_epoch <= epoch);
        self.checks = waiting;
        for (_, resp) in settled {
            let _ = resp.send(Ok(()));
        }

        if self.state == ExchangeState::Initializing {
            log_info!("[exchange:{}] ready", self.name);
            self.ready_epoch = epoch;
            self.set_state(ExchangeState::Ready);
            self.flush_deferred();
            return;
        }

        log_info!("[exchange:{}] reconnected (epoch {epoch})", self.name);
        self.set_state(ExchangeState::Reconnected);
        self.maybe_republish();
    }

    /// Republish once bindings for the channel's epoch are in place.
    fn maybe_republish(&mut self) {
        // ---
        let Some(epoch) = self.lease.as_ref().map(|lease| lease.epoch) else {
            return;
        };
        if epoch != self.ready_epoch && self.completed_epoch < epoch {
            log_debug!("[exchange:{}] waiting for bindings (epoch {epoch})", self.name);
            return;
        }

        self.sweep();
        self.round += 1;

        let sequences = self.log.sequences();
        let messages = self.log.reset();
        if !messages.is_empty() {
            log_info!("[exchange:{}] republishing {} messages", self.name, messages.len());
        }

        self.ready_epoch = epoch;
        self.set_state(ExchangeState::Ready);

        for (sequence, message) in sequences.into_iter().zip(messages) {
            match self.responders.remove(&sequence) {
                Some(resp) => self.perform(message, resp),
                None => {
                    // Nobody is waiting; log the outcome.
                    let (resp, rx) = oneshot::channel();
                    let name = self.name.clone();
                    tokio::spawn(async move {
                        if let Ok(Err(_err)) = rx.await {
                            log_warn!("[exchange:{name}] republish failed: {_err}");
                        }
                    });
                    self.perform(message, resp);
                }
            }
        }

        self.flush_deferred();
    }

    fn on_failed(&mut self, err: BusError) {
        // ---
        log_error!("[exchange:{}] definition failed: {err}", self.name);
        self.failure = Some(err.clone());
        self.set_state(ExchangeState::Failed);

        for (_, resp) in self.checks.drain(..) {
            let _ = resp.send(Err(err.clone()));
        }
        for (_, resp) in self.deferred.drain(..) {
            let _ = resp.send(Err(err.clone()));
        }
        for (_, resp) in self.responders.drain() {
            let _ = resp.send(Err(err.clone()));
        }
        self.log.reset();
    }

    fn on_publish(&mut self, message: Message, resp: PublishResp) {
        // ---
        match self.state {
            ExchangeState::Ready => self.perform(message, resp),
            ExchangeState::Failed => {
                let _ = resp.send(Err(self.failure_error()));
            }
            ExchangeState::Destroyed => {
                let _ = resp.send(Err(BusError::Destroyed(format!("exchange '{}'", self.name))));
            }
            _ => {
                self.deferred.retain(|(_, r)| !r.is_closed());
                self.deferred.push_back((message, resp));
            }
        }
    }

    fn flush_deferred(&mut self) {
        // ---
        let deferred: Vec<_> = self.deferred.drain(..).collect();
        for (message, resp) in deferred {
            if resp.is_closed() {
                continue;
            }
            self.perform(message, resp);
        }
    }

    /// Log the message and publish it on the current channel.
    fn perform(&mut self, mut message: Message, resp: PublishResp) {
        // ---
        let Some(channel) = self.lease.as_ref().map(|lease| lease.channel.clone()) else {
            self.deferred.push_back((message, resp));
            return;
        };

        let sequence = self.log.add(&mut message);
        self.responders.insert(sequence, resp);
        spawn_publish(
            channel,
            self.name.clone(),
            message,
            sequence,
            self.round,
            self.report_tx.clone(),
        );
    }

    /// Forget publishes whose callers gave up waiting.
    fn sweep(&mut self) {
        // ---
        let abandoned: Vec<u64> = self
            .responders
            .iter()
            .filter(|(_, resp)| resp.is_closed())
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in abandoned {
            self.responders.remove(&sequence);
            self.log.remove(sequence);
            log_debug!("[exchange:{}] publish {sequence} abandoned", self.name);
        }
        self.deferred.retain(|(_, resp)| !resp.is_closed());
    }

    async fn shutdown(&mut self, err: BusError) {
        // ---
        self.run += 1;
        self.round += 1;
        self.set_state(ExchangeState::Destroyed);

        let unconfirmed = self.log.count();
        if unconfirmed > 0 {
            log_warn!(
                "[exchange:{}] destroyed with {unconfirmed} unconfirmed publishes",
                self.name
            );
        }

        for (_, resp) in self.checks.drain(..) {
            let _ = resp.send(Err(err.clone()));
        }
        for (_, resp) in self.deferred.drain(..) {
            let _ = resp.send(Err(err.clone()));
        }
        for (_, resp) in self.responders.drain() {
            let _ = resp.send(Err(err.clone()));
        }

        if !self.resource_gone {
            self.resource.destroy().await;
        }
        log_debug!("[exchange:{}] destroyed", self.name);
    }
}

fn spawn_publish(
    channel: ChannelPtr,
    exchange: String,
    message: Message,
    sequence: u64,
    round: u64,
    report: mpsc::UnboundedSender<Report>,
) {
    // ---
    tokio::spawn(async move {
        let result = channel
            .publish(
                &exchange,
                &message.routing_key,
                message.content.clone(),
                &message.properties,
            )
            .await;
        let _ = report.send(Report::Published {
            round,
            sequence,
            result,
        });
    });
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::domain::QueueDef;
    use crate::{create_memory_broker, ConnectionConfig, MemoryBroker};

    async fn connected(broker: &MemoryBroker) -> Connection {
        // ---
        let conn = Connection::new(
            ConnectionConfig::with_servers("test", ["localhost"]),
            create_memory_broker(broker),
        );
        conn.connect().await.unwrap();
        conn
    }

    /// Declare a queue bound to `exchange` with key `key` on a side channel.
    async fn bind_queue(conn: &Connection, exchange: &str, queue: &str, key: &str) {
        // ---
        let (broker_conn, _) = conn.acquire().await.unwrap();
        let channel = broker_conn.create_channel(false).await.unwrap();
        channel
            .declare_queue(&QueueDef {
                name: queue.into(),
                durable: false,
                auto_delete: false,
                exclusive: false,
                dead_letter: None,
                max_length: None,
            })
            .await
            .unwrap();
        channel.bind_queue(queue, exchange, key).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_routes_when_ready() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;

        exchange.check().await.unwrap();
        assert_eq!(exchange.state(), ExchangeState::Ready);
        bind_queue(&conn, "orders", "orders.q", "created").await;

        exchange.publish(Message::new("created", "{}")).await.unwrap();

        assert_eq!(broker.queue_depth("orders.q"), 1);
        assert_eq!(exchange.unconfirmed().await, 0);
    }

    #[tokio::test]
    async fn test_publish_before_ready_is_deferred() {
        // ---
        let broker = MemoryBroker::new();
        let conn = Connection::new(
            ConnectionConfig::with_servers("test", ["localhost"]),
            create_memory_broker(&broker),
        );
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;

        let pending = tokio::spawn({
            let exchange = exchange.clone();
            async move { exchange.publish(Message::new("created", "{}")).await }
        });

        conn.connect().await.unwrap();

        assert_eq!(pending.await.unwrap(), Ok(()));
        assert!(broker.has_exchange("orders"));
    }

    #[tokio::test]
    async fn test_publish_timeout_is_detached() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(
            ExchangeOptions::new("orders").with_publish_timeout(Duration::from_millis(50)),
            &conn,
        )
        .await;
        exchange.check().await.unwrap();
        bind_queue(&conn, "orders", "orders.q", "created").await;

        broker.set_blocked(true);
        let err = exchange.publish(Message::new("created", "{}")).await.unwrap_err();
        assert!(matches!(err, BusError::PublishTimeout { .. }));
        assert_eq!(exchange.unconfirmed().await, 0);

        // Per-message timeout wins over the exchange default.
        let err = exchange
            .publish(Message::new("created", "{}").with_timeout(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BusError::PublishTimeout {
                exchange: "orders".into(),
                timeout: Duration::from_millis(10),
            }
        );
        broker.set_blocked(false);
    }

    #[tokio::test]
    async fn test_failed_declaration_rejects_publishes() {
        // ---
        let broker = MemoryBroker::new();
        broker.fail_declare("orders", true);
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;

        assert!(matches!(exchange.check().await, Err(BusError::Declaration { .. })));
        assert_eq!(exchange.state(), ExchangeState::Failed);
        assert!(matches!(
            exchange.publish(Message::new("k", "v")).await,
            Err(BusError::Declaration { .. })
        ));
    }

    #[tokio::test]
    async fn test_check_missing_exchange_fails() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("missing").with_check(true), &conn).await;

        assert!(matches!(exchange.check().await, Err(BusError::NotFound(_))));
        assert!(!broker.has_exchange("missing"));
    }

    #[tokio::test]
    async fn test_channel_loss_republishes_on_same_epoch() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;
        exchange.check().await.unwrap();
        bind_queue(&conn, "orders", "orders.q", "created").await;

        broker.set_blocked(true);
        let pending = tokio::spawn({
            let exchange = exchange.clone();
            async move { exchange.publish(Message::new("created", "{}")).await }
        });
        while exchange.unconfirmed().await == 0 {
            tokio::task::yield_now().await;
        }

        broker.close_all_channels();
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.set_blocked(false);

        assert_eq!(pending.await.unwrap(), Ok(()));
        assert_eq!(broker.queue_depth("orders.q"), 1);
        assert_eq!(exchange.unconfirmed().await, 0);
    }

    #[tokio::test]
    async fn test_failed_republish_still_reaches_ready() {
        // ---
        let broker = MemoryBroker::new();
        let conn = Connection::new(
            ConnectionConfig::with_servers("test", ["localhost"]).with_publish_confirms(true),
            create_memory_broker(&broker),
        );
        conn.connect().await.unwrap();
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;
        exchange.check().await.unwrap();

        broker.set_blocked(true);
        let pending = tokio::spawn({
            let exchange = exchange.clone();
            async move { exchange.publish(Message::new("created", "{}")).await }
        });
        while exchange.unconfirmed().await == 0 {
            tokio::task::yield_now().await;
        }

        broker.fail_publishes(true);
        broker.close_all_channels();
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.set_blocked(false);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BusError::PublishRejected { .. })), "{result:?}");
        assert_eq!(exchange.state(), ExchangeState::Ready);
        assert_eq!(exchange.unconfirmed().await, 0);

        broker.fail_publishes(false);
        exchange.publish(Message::new("created", "{}")).await.unwrap();
    }

    #[tokio::test]
    async fn test_debug_shows_name_and_state() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;
        exchange.check().await.unwrap();

        let shown = format!("{exchange:?}");
        assert!(shown.contains("orders"), "{shown}");
        assert!(shown.contains("Ready"), "{shown}");
    }

    #[tokio::test]
    async fn test_reconnected_waits_for_bindings() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;
        exchange.check().await.unwrap();

        broker.disconnect_all();
        let mut state = exchange.watch_state();
        state
            .wait_for(|s| *s == ExchangeState::Reconnected)
            .await
            .unwrap();

        // Publishes queue up until bindings are reported for the new epoch.
        let pending = tokio::spawn({
            let exchange = exchange.clone();
            async move { exchange.publish(Message::new("created", "{}")).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(exchange.state(), ExchangeState::Reconnected);

        exchange.bindings_completed(conn.epoch()).await;
        state.wait_for(|s| *s == ExchangeState::Ready).await.unwrap();
        assert_eq!(pending.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_destroy_rejects_publishes() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let exchange = Exchange::new(ExchangeOptions::new("orders"), &conn).await;
        exchange.check().await.unwrap();

        exchange.destroy().await;

        assert_eq!(exchange.state(), ExchangeState::Destroyed);
        assert!(matches!(
            exchange.publish(Message::new("k", "v")).await,
            Err(BusError::Destroyed(_))
        ));
    }
}
