// src/queue.rs

//! Queue state machine.
//!
//! ```text
//! initializing -> ready -> destroying -> destroyed
//!             \-> failed
//! ```
//!
//! A [`Queue`] declares (or verifies) its queue on a dedicated channel,
//! applies the prefetch limit and runs consumers. Subscriptions are
//! remembered: whenever the channel is lost the queue throws the channel
//! resource away, builds a new one, discards the acknowledgement ledger
//! (delivery tags are channel-scoped) and replays every subscription.
//!
//! ## Acknowledgement modes
//!
//! - `no_ack`: the broker considers messages settled on delivery; the
//!   [`MessageOps`] handed to handlers only count.
//! - `no_batch`: every ack/nack/reject is an individual broker call.
//! - default: decisions go through the queue's [`AckBatch`] and are flushed
//!   as cumulative calls every `ack_interval`.
//!
//! A handler that returns an error or panics has its message rejected
//! (unless it already resolved it) and the failure is logged.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[allow(unused_imports)]
use crate::{
    // ---
    ack_batch::{AckBatch, TagOps},
    connection::Connection,
    domain::{ChannelPtr, ConsumeParams, Delivery, QueueDef, Resolution},
    log_debug,
    log_error,
    log_info,
    log_warn,
    resource::{ChannelResource, Lease, ResourceState, ResourceStatus},
    retry::Backoff,
    BusError,
    QueueOptions,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Initializing,
    Ready,
    Destroying,
    Destroyed,
    Failed,
}

/// Message handler: receives each delivery with the operations that settle it.
pub type Handler = Arc<dyn Fn(Delivery, MessageOps) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery, MessageOps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |delivery, ops| Box::pin(f(delivery, ops)))
}

/// Per-subscription consumer options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeOptions {
    /// Consumer tag; generated when absent.
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
}

impl SubscribeOptions {
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Settles one delivered message. The first resolution wins; later calls
/// are no-ops.
#[derive(Clone)]
pub struct MessageOps {
    tag: u64,
    kind: OpsKind,
}

#[derive(Clone)]
enum OpsKind {
    NoAck,
    Immediate {
        channel: ChannelPtr,
        done: Arc<AtomicBool>,
    },
    Batched(TagOps),
}

impl MessageOps {
    fn no_ack(tag: u64) -> Self {
        Self {
            tag,
            kind: OpsKind::NoAck,
        }
    }

    fn immediate(tag: u64, channel: ChannelPtr) -> Self {
        // ---
        Self {
            tag,
            kind: OpsKind::Immediate {
                channel,
                done: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    fn batched(ops: TagOps) -> Self {
        Self {
            tag: ops.tag(),
            kind: OpsKind::Batched(ops),
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub async fn ack(&self) -> Result<()> {
        self.resolve(Resolution::Ack).await
    }

    /// Negative acknowledgement; the broker requeues the message.
    pub async fn nack(&self) -> Result<()> {
        self.resolve(Resolution::Nack).await
    }

    pub async fn reject(&self) -> Result<()> {
        self.resolve(Resolution::Reject).await
    }

    pub async fn resolve(&self, resolution: Resolution) -> Result<()> {
        // ---
        match &self.kind {
            OpsKind::NoAck => Ok(()),
            OpsKind::Batched(ops) => {
                ops.resolve(resolution);
                Ok(())
            }
            OpsKind::Immediate { channel, done } => {
                if done.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                match resolution {
                    Resolution::Ack => channel.ack(self.tag, false).await,
                    Resolution::Nack => channel.nack(self.tag, false, true).await,
                    Resolution::Reject => channel.reject(self.tag, false).await,
                }
            }
        }
    }
}

#[derive(Clone)]
struct Subscription {
    handler: Handler,
    params: ConsumeParams,
}

#[derive(Clone, Copy)]
enum AckMode {
    NoAck,
    Immediate,
    Batched,
}

//
// Actor commands
//

enum Cmd {
    //
    Subscribe {
        handler: Handler,
        options: SubscribeOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Purge {
        resp: oneshot::Sender<Result<u32>>,
    },
    Check {
        min_epoch: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    FlushAcks {
        resp: oneshot::Sender<usize>,
    },
    Destroy {
        resp: oneshot::Sender<()>,
    },
}

enum Deferred {
    Subscribe(Subscription, oneshot::Sender<Result<()>>),
    Purge(oneshot::Sender<Result<u32>>),
}

enum Report {
    //
    Initialized {
        run: u64,
        result: Result<(Lease, Vec<mpsc::Receiver<Delivery>>)>,
    },
    Subscribed {
        run: u64,
        subscription: Subscription,
        result: Result<mpsc::Receiver<Delivery>>,
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Report(Report),
    Resource(ResourceStatus),
    Stop,
}

/// Handle to a queue state machine. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    options: QueueOptions,
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<QueueState>,
    received: Arc<AtomicU64>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Queue {
    /// Create the machine and start defining the queue on a dedicated
    /// channel of `connection`.
    pub async fn new(options: QueueOptions, connection: &Connection) -> Self {
        // ---
        let name = options.name.clone();
        let resource = ChannelResource::new(format!("queue:{name}"), connection, false).await;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(QueueState::Initializing);
        let received = Arc::new(AtomicU64::new(0));

        let mode = if options.no_ack {
            AckMode::NoAck
        } else if options.no_batch {
            AckMode::Immediate
        } else {
            AckMode::Batched
        };

        let mut actor = Actor {
            batch: AckBatch::new(format!("queue:{name}")),
            name,
            options: options.clone(),
            mode,
            ack_interval: connection.config().ack_interval,
            connection: connection.clone(),
            status_rx: resource.watch(),
            resource,
            resource_gone: false,
            backoff: Backoff::new(connection.config().backoff),
            state: QueueState::Initializing,
            state_tx,
            lease: None,
            failure: None,
            received: Arc::clone(&received),
            ticker: None,
            consumers: Vec::new(),
            subscriptions: Vec::new(),
            deferred: VecDeque::new(),
            checks: Vec::new(),
            run: 0,
            cmd_rx,
            report_tx,
            report_rx,
        };
        actor.start_init(Duration::ZERO);
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(Inner {
                options,
                cmd_tx,
                state_rx,
                received,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<QueueState> {
        self.inner.state_rx.clone()
    }

    /// Messages delivered to this queue's consumers so far.
    pub fn received_count(&self) -> u64 {
        self.inner.received.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> BusError {
        BusError::Destroyed(format!("queue '{}'", self.inner.options.name))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| self.destroyed())?;
        rx.await.map_err(|_| self.destroyed())
    }

    /// Resolve once the queue is `ready`.
    pub async fn check(&self) -> Result<()> {
        self.check_epoch(0).await
    }

    /// Resolve once the queue is `ready` on a channel from connection epoch
    /// `min_epoch` or later.
    pub(crate) async fn check_epoch(&self, min_epoch: u64) -> Result<()> {
        self.request(|resp| Cmd::Check { min_epoch, resp }).await?
    }

    /// Start consuming with `handler`. Resolves once the broker registered
    /// the consumer. The subscription survives channel and connection loss.
    pub async fn subscribe(&self, handler: Handler, options: SubscribeOptions) -> Result<()> {
        // ---
        self.request(|resp| Cmd::Subscribe {
            handler,
            options,
            resp,
        })
        .await?
    }

    /// Drop every message waiting in the queue. Returns the purged count.
    pub async fn purge(&self) -> Result<u32> {
        self.request(|resp| Cmd::Purge { resp }).await?
    }

    /// Send every resolvable acknowledgement now instead of waiting for the
    /// next interval. Returns the number of broker calls issued.
    pub async fn flush_acks(&self) -> Result<usize> {
        self.request(|resp| Cmd::FlushAcks { resp }).await
    }

    /// Stop consumers, flush acknowledgements and close the channel.
    pub async fn destroy(&self) {
        let _ = self.request(|resp| Cmd::Destroy { resp }).await;
    }
}

/// Background actor that owns the queue state.
struct Actor {
    // ---
    name: String,
    options: QueueOptions,
    mode: AckMode,
    ack_interval: Duration,
    connection: Connection,
    resource: ChannelResource,
    status_rx: watch::Receiver<ResourceStatus>,
    resource_gone: bool,
    backoff: Backoff,

    state: QueueState,
    state_tx: watch::Sender<QueueState>,
    lease: Option<Lease>,
    failure: Option<BusError>,

    batch: Arc<AckBatch>,
    received: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
    deferred: VecDeque<Deferred>,
    checks: Vec<(u64, oneshot::Sender<Result<()>>)>,
    /// Bumped on every (re)initialization; older reports are stale.
    run: u64,

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
                    self.shutdown().await;
                    let _ = resp.send(());
                    break;
                }
                ActorStep::Cmd(cmd) => self.handle_cmd(cmd).await,
                ActorStep::Report(report) => self.handle_report(report),
                ActorStep::Resource(status) => {
                    if status.state == ResourceState::Destroyed {
                        self.shutdown().await;
                        break;
                    }
                    self.on_resource(status).await;
                }
                ActorStep::Stop => {
                    self.shutdown().await;
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

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Subscribe {
                handler,
                options,
                resp,
            } => {
                let subscription = Subscription {
                    handler,
                    params: ConsumeParams {
                        consumer_tag: options
                            .consumer_tag
                            .unwrap_or_else(|| format!("{}.{}", self.name, uuid::Uuid::new_v4())),
                        no_ack: self.options.no_ack,
                        exclusive: options.exclusive,
                    },
                };
                self.on_subscribe(subscription, resp);
            }
            Cmd::Purge { resp } => self.on_purge(resp),
            Cmd::Check { min_epoch, resp } => match self.state {
                QueueState::Ready if self.lease.as_ref().is_some_and(|l| l.epoch >= min_epoch) => {
                    let _ = resp.send(Ok(()));
                }
                QueueState::Failed => {
                    let _ = resp.send(Err(self.failure_error()));
                }
                QueueState::Destroying | QueueState::Destroyed => {
                    let _ = resp.send(Err(BusError::Destroyed(format!("queue '{}'", self.name))));
                }
                QueueState::Ready | QueueState::Initializing => self.checks.push((min_epoch, resp)),
            },
            Cmd::FlushAcks { resp } => {
                let calls = match &self.lease {
                    Some(lease) => self.batch.flush(&*lease.channel).await,
                    None => 0,
                };
                let _ = resp.send(calls);
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
            Report::Initialized { run, result } => {
                if run != self.run {
                    return;
                }
                match result {
                    Ok((lease, receivers)) => self.on_initialized(lease, receivers),
                    Err(err) if err.is_transient() => {
                        let delay = self.backoff.next_delay();
                        log_warn!("[queue:{}] init interrupted, retrying in {delay:?}: {err}", self.name);
                        self.start_init(delay);
                    }
                    Err(err) => self.on_failed(err),
                }
            }
            Report::Subscribed {
                run,
                subscription,
                result,
                resp,
            } => {
                if run != self.run {
                    // The channel was replaced mid-subscribe; try again on the new one.
                    self.on_subscribe(subscription, resp);
                    return;
                }
                match result {
                    Ok(receiver) => {
                        log_info!(
                            "[queue:{}] consumer {} registered",
                            self.name,
                            subscription.params.consumer_tag
                        );
                        self.spawn_consumer(receiver, subscription.handler.clone());
                        self.subscriptions.push(subscription);
                        let _ = resp.send(Ok(()));
                    }
                    Err(err) => {
                        log_warn!("[queue:{}] subscribe failed: {err}", self.name);
                        let _ = resp.send(Err(err));
                    }
                }
            }
        }
    }

    async fn on_resource(&mut self, status: ResourceStatus) {
        // ---
        let Some(lease) = &self.lease else {
            return;
        };
        if status.generation != lease.generation
            || status.state != ResourceState::Released
            || self.state != QueueState::Ready
        {
            return;
        }

        log_info!("[queue:{}] channel released, rebuilding", self.name);
        self.stop_consuming();
        self.lease = None;
        self.batch.reset();

        self.resource.destroy().await;
        self.resource = ChannelResource::new(format!("queue:{}", self.name), &self.connection, false).await;
        self.status_rx = self.resource.watch();
        self.resource_gone = false;

        self.set_state(QueueState::Initializing);
        self.start_init(Duration::ZERO);
    }

    fn set_state(&mut self, state: QueueState) {
        // ---
        if self.state != state {
            log_debug!("[queue:{}] {:?} -> {:?}", self.name, self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn failure_error(&self) -> BusError {
        // ---
        self.failure.clone().unwrap_or_else(|| BusError::Declaration {
            entity: format!("queue '{}'", self.name),
            reason: "definition failed".into(),
        })
    }

    fn start_init(&mut self, delay: Duration) {
        // ---
        self.run += 1;

        let resource = self.resource.clone();
        let definition: QueueDef = self.options.definition();
        let check = self.options.check;
        let prefetch = self.options.limit;
        let params: Vec<ConsumeParams> = self.subscriptions.iter().map(|s| s.params.clone()).collect();
        let report = self.report_tx.clone();
        let run = self.run;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = async {
                let lease = resource.get(true).await?;
                let channel = &lease.channel;
                if check {
                    channel.check_queue(&definition.name).await?;
                } else {
                    channel.declare_queue(&definition).await?;
                }
                if let Some(prefetch) = prefetch {
                    channel.qos(prefetch).await?;
                }
                let mut receivers = Vec::with_capacity(params.len());
                for params in params {
                    receivers.push(channel.consume(&definition.name, params).await?);
                }
                Ok::<_, BusError>((lease, receivers))
            }
            .await;
            let _ = report.send(Report::Initialized { run, result });
        });
    }

    fn on_initialized(&mut self, lease: Lease, receivers: Vec<mpsc::Receiver<Delivery>>) {
        // ---
        self.backoff.reset();
        let epoch = lease.epoch;
        self.lease = Some(lease);

        let handlers: Vec<Handler> = self.subscriptions.iter().map(|s| s.handler.clone()).collect();
        if !handlers.is_empty() {
            log_info!("[queue:{}] resubscribed {} consumer(s)", self.name, handlers.len());
        }
        for (receiver, handler) in receivers.into_iter().zip(handlers) {
            self.spawn_consumer(receiver, handler);
        }
        self.start_ticker();

        log_info!("[queue:{}] ready", self.name);
        self.set_state(QueueState::Ready);

        let (settled, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.checks)
            .into_iter()
            .partition(|(min_epoch, _)| *min_epoch <= epoch);
        self.checks = waiting;
        for (_, resp) in settled {
            let _ = resp.send(Ok(()));
        }
        let deferred: Vec<Deferred> = self.deferred.drain(..).collect();
        for item in deferred {
            match item {
                Deferred::Subscribe(subscription, resp) => self.on_subscribe(subscription, resp),
                Deferred::Purge(resp) => self.on_purge(resp),
            }
        }
    }

    fn on_failed(&mut self, err: BusError) {
        // ---
        log_error!("[queue:{}] definition failed: {err}", self.name);
        self.failure = Some(err.clone());
        self.set_state(QueueState::Failed);

        for (_, resp) in self.checks.drain(..) {
            let _ = resp.send(Err(err.clone()));
        }
        for item in self.deferred.drain(..) {
            match item {
                Deferred::Subscribe(_, resp) => {
                    let _ = resp.send(Err(err.clone()));
                }
                Deferred::Purge(resp) => {
                    let _ = resp.send(Err(err.clone()));
                }
            }
        }
    }

    fn on_subscribe(&mut self, subscription: Subscription, resp: oneshot::Sender<Result<()>>) {
        // ---
        match self.state {
            QueueState::Ready => {}
            QueueState::Initializing => {
                self.deferred.push_back(Deferred::Subscribe(subscription, resp));
                return;
            }
            QueueState::Failed => {
                let _ = resp.send(Err(self.failure_error()));
                return;
            }
            QueueState::Destroying | QueueState::Destroyed => {
                let _ = resp.send(Err(BusError::Destroyed(format!("queue '{}'", self.name))));
                return;
            }
        }

        let Some(channel) = self.lease.as_ref().map(|lease| lease.channel.clone()) else {
            self.deferred.push_back(Deferred::Subscribe(subscription, resp));
            return;
        };

        let queue = self.name.clone();
        let report = self.report_tx.clone();
        let run = self.run;
        tokio::spawn(async move {
            let result = channel.consume(&queue, subscription.params.clone()).await;
            let _ = report.send(Report::Subscribed {
                run,
                subscription,
                result,
                resp,
            });
        });
    }

    fn on_purge(&mut self, resp: oneshot::Sender<Result<u32>>) {
        // ---
        match self.state {
            QueueState::Ready => {}
            QueueState::Initializing => {
                self.deferred.push_back(Deferred::Purge(resp));
                return;
            }
            QueueState::Failed => {
                let _ = resp.send(Err(self.failure_error()));
                return;
            }
            QueueState::Destroying | QueueState::Destroyed => {
                let _ = resp.send(Err(BusError::Destroyed(format!("queue '{}'", self.name))));
                return;
            }
        }

        let Some(channel) = self.lease.as_ref().map(|lease| lease.channel.clone()) else {
            self.deferred.push_back(Deferred::Purge(resp));
            return;
        };

        let queue = self.name.clone();
        tokio::spawn(async move {
            let result = channel.purge(&queue).await;
            if let Ok(_count) = &result {
                log_info!("[queue:{queue}] purged {_count} message(s)");
            }
            let _ = resp.send(result);
        });
    }

    fn spawn_consumer(&mut self, mut receiver: mpsc::Receiver<Delivery>, handler: Handler) {
        // ---
        let Some(channel) = self.lease.as_ref().map(|lease| lease.channel.clone()) else {
            return;
        };
        let mode = self.mode;
        let batch = Arc::clone(&self.batch);
        let received = Arc::clone(&self.received);
        let name = self.name.clone();

        self.consumers.push(tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                received.fetch_add(1, Ordering::SeqCst);
                let tag = delivery.tag;

                let ops = match mode {
                    AckMode::NoAck => MessageOps::no_ack(tag),
                    AckMode::Immediate => MessageOps::immediate(tag, channel.clone()),
                    AckMode::Batched => {
                        batch.add_message(tag);
                        MessageOps::batched(batch.message_ops(tag))
                    }
                };

                let handler = handler.clone();
                let name = name.clone();
                tokio::spawn(run_handler(name, handler, delivery, ops));
            }
            log_debug!("[queue:{name}] consumer stream ended");
        }));
    }

    fn start_ticker(&mut self) {
        // ---
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        let AckMode::Batched = self.mode else {
            return;
        };
        let Some(channel) = self.lease.as_ref().map(|lease| lease.channel.clone()) else {
            return;
        };

        let batch = Arc::clone(&self.batch);
        let period = self.ack_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                batch.signal(&*channel).await;
            }
        }));
    }

    fn stop_consuming(&mut self) {
        // ---
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        for consumer in self.consumers.drain(..) {
            consumer.abort();
        }
    }

    async fn shutdown(&mut self) {
        // ---
        self.run += 1;
        self.set_state(QueueState::Destroying);
        self.stop_consuming();

        if let Some(lease) = self.lease.take() {
            for subscription in &self.subscriptions {
                let _ = lease.channel.cancel(&subscription.params.consumer_tag).await;
            }
            self.batch.flush(&*lease.channel).await;
        } else if self.batch.pending_count() > 0 {
            log_warn!(
                "[queue:{}] destroyed with {} unresolved message(s)",
                self.name,
                self.batch.pending_count()
            );
        }

        let destroyed = BusError::Destroyed(format!("queue '{}'", self.name));
        for (_, resp) in self.checks.drain(..) {
            let _ = resp.send(Err(destroyed.clone()));
        }
        for item in self.deferred.drain(..) {
            match item {
                Deferred::Subscribe(_, resp) => {
                    let _ = resp.send(Err(destroyed.clone()));
                }
                Deferred::Purge(resp) => {
                    let _ = resp.send(Err(destroyed.clone()));
                }
            }
        }

        if !self.resource_gone {
            self.resource.destroy().await;
        }
        self.set_state(QueueState::Destroyed);
        log_debug!("[queue:{}] destroyed", self.name);
    }
}

/// Run one handler invocation, rejecting the message if it fails or panics.
async fn run_handler(queue: String, handler: Handler, delivery: Delivery, ops: MessageOps) {
    // ---
    let tag = delivery.tag;
    let task_ops = ops.clone();
    let outcome = tokio::spawn(async move { handler(delivery, task_ops).await }).await;

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => BusError::Handler(err.to_string()),
        Err(join) if join.is_panic() => BusError::Handler("handler panicked".into()),
        Err(_) => BusError::Handler("handler cancelled".into()),
    };

    log_error!("[queue:{queue}] message {tag} rejected: {failure}");
    if let Err(_err) = ops.reject().await {
        log_warn!("[queue:{queue}] reject of message {tag} failed: {_err}");
    }
}
