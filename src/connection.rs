// src/connection.rs

//! Connection state machine.
//!
//! A [`Connection`] owns one physical broker connection. All state lives in a
//! background actor task; the public handle only sends commands and awaits
//! the actor's answers.
//!
//! ## States
//!
//! ```text
//! initializing -> connecting -> connected <-> failed -> connecting
//!                                connected -> closing -> closed
//! ```
//!
//! - Connect attempts run in spawned tasks that report back, so the actor is
//!   never blocked by broker I/O and `destroy()` is always served promptly.
//! - Endpoints are tried round-robin. The initial connect gives up with
//!   [`BusError::ConnectionExhausted`] once every endpoint (or `retry_limit`
//!   attempts, whichever is larger) has failed; after a first success the
//!   machine retries forever with [`Backoff`].
//! - `connect()` and `close()` calls that arrive mid-transition are deferred
//!   and replayed in FIFO order once the machine settles.
//! - Every entry to `connected` increments the connection *epoch*. The first
//!   entry emits [`ConnectionEvent::Connected`], later ones
//!   [`ConnectionEvent::Reconnected`].
//!
//! Channel resources register a [`Teardown`] handle with their connection;
//! closing the connection tears down every registered channel in parallel
//! before the broker connection itself is closed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[allow(unused_imports)]
use crate::{
    // ---
    domain::{BrokerPtr, ConnectionPtr, Endpoint},
    log_debug,
    log_error,
    log_info,
    log_warn,
    retry::Backoff,
    BusError,
    ConnectionConfig,
    Result,
};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initializing,
    Connecting,
    Connected,
    Failed,
    Closing,
    Closed,
}

/// Lifecycle notifications broadcast by a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First successful connect.
    Connected { epoch: u64 },
    /// Any later successful connect, including after an explicit close.
    Reconnected { epoch: u64 },
    /// A connect attempt failed or an established connection was lost.
    Failed { error: BusError },
    Closed,
    Destroyed,
}

/// Something a connection tears down when it closes.
#[async_trait::async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self);
}

pub type TeardownPtr = Arc<dyn Teardown>;

type AcquireResp = oneshot::Sender<Result<(ConnectionPtr, u64)>>;

//
// Actor commands
//

enum Cmd {
    //
    Connect {
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
    Acquire {
        resp: AcquireResp,
    },
    Destroy {
        resp: oneshot::Sender<()>,
    },
}

enum Deferred {
    Connect(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Outcomes of work the actor spawned.
enum Report {
    //
    Attempt {
        generation: u64,
        result: Result<ConnectionPtr>,
    },
    Lost {
        generation: u64,
        error: BusError,
    },
    RetryElapsed {
        generation: u64,
    },
    Closed {
        generation: u64,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Report(Report),
    Stop,
}

enum Flow {
    Continue,
    Stop,
}

/// Handle to a connection state machine.
///
/// Cheap to clone; all clones drive the same actor.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    name: String,
    config: ConnectionConfig,
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    epoch: Arc<AtomicU64>,
    owners: Arc<Owners>,
}

/// Teardown handles of the resources living on this connection, keyed by a
/// per-registration id so same-named resources never collide.
#[derive(Default)]
struct Owners {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, TeardownPtr>>,
}

impl Owners {
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, TeardownPtr>> {
        lock_ignore_poison(&self.entries)
    }

    fn take_all(&self) -> Vec<TeardownPtr> {
        self.entries().drain().map(|(_, owner)| owner).collect()
    }
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Connection {
    /// Create the machine in `initializing`. Nothing is dialled until
    /// [`connect`](Self::connect) is called.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ConnectionConfig, broker: BrokerPtr) -> Self {
        // ---
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initializing);
        let (events, _) = broadcast::channel(64);
        let epoch = Arc::new(AtomicU64::new(0));
        let owners = Arc::new(Owners::default());

        let actor = Actor {
            name: config.name.clone(),
            endpoints: config.endpoints(),
            attempt_limit: config.attempt_limit(),
            index: 0,
            backoff: Backoff::new(config.backoff),
            broker,
            state: ConnectionState::Initializing,
            state_tx,
            events: events.clone(),
            epoch: Arc::clone(&epoch),
            cmd_rx,
            report_tx,
            report_rx,
            connection: None,
            generation: 0,
            ever_connected: false,
            established: false,
            failures: 0,
            waiters: Vec::new(),
            acquirers: Vec::new(),
            deferred: VecDeque::new(),
            closing: None,
            owners: Arc::clone(&owners),
            tasks: Vec::new(),
            retry: None,
        };

        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                config,
                cmd_tx,
                state_rx,
                events,
                epoch,
                owners,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of times the machine has entered `connected`.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.inner
            .cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| BusError::Destroyed(format!("connection '{}'", self.inner.name)))?;

        rx.await
            .map_err(|_| BusError::Destroyed(format!("connection '{}'", self.inner.name)))
    }

    /// Connect, resolving once the machine reaches `connected`.
    ///
    /// Resolves immediately when already connected. A call made while an
    /// attempt is in flight shares that attempt's outcome.
    pub async fn connect(&self) -> Result<()> {
        self.request(|resp| Cmd::Connect { resp }).await?
    }

    /// Tear down every owned channel, then close the broker connection.
    pub async fn close(&self) -> Result<()> {
        self.request(|resp| Cmd::Close { resp }).await?
    }

    /// The live broker connection and its epoch.
    ///
    /// Waits while the machine is not connected; fails once it is closed with
    /// no connect pending, or destroyed.
    pub async fn acquire(&self) -> Result<(ConnectionPtr, u64)> {
        self.request(|resp| Cmd::Acquire { resp }).await?
    }

    /// Stop the machine for good. Pending calls fail with
    /// [`BusError::Destroyed`].
    pub async fn destroy(&self) {
        let _ = self.request(|resp| Cmd::Destroy { resp }).await;
    }

    /// Hand `owner` to the connection for teardown on close. Returns the id
    /// to pass to [`unregister`](Self::unregister).
    pub(crate) fn register(&self, owner: TeardownPtr) -> u64 {
        // ---
        let id = self.inner.owners.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.owners.entries().insert(id, owner);
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.inner.owners.entries().remove(&id);
    }
}

/// Background actor that owns the connection state.
struct Actor {
    // ---
    name: String, // for logging only
    endpoints: Vec<Endpoint>,
    attempt_limit: u32,
    index: usize,
    backoff: Backoff,
    broker: BrokerPtr,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    epoch: Arc<AtomicU64>,

    cmd_rx: mpsc::Receiver<Cmd>,
    report_tx: mpsc::UnboundedSender<Report>,
    report_rx: mpsc::UnboundedReceiver<Report>,

    connection: Option<ConnectionPtr>,
    /// Bumped whenever outstanding reports become stale.
    generation: u64,
    ever_connected: bool,
    /// True from the first successful connect until the next close.
    established: bool,
    failures: u32,

    waiters: Vec<oneshot::Sender<Result<()>>>,
    acquirers: Vec<AcquireResp>,
    deferred: VecDeque<Deferred>,
    closing: Option<oneshot::Sender<Result<()>>>,
    owners: Arc<Owners>,
    tasks: Vec<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[connection:{}] actor started", self.name);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    if let Flow::Stop = self.handle_cmd(cmd).await {
                        break;
                    }
                }
                ActorStep::Report(report) => self.handle_report(report),
                ActorStep::Stop => {
                    self.shutdown().await;
                    break;
                }
            }
        }

        log_debug!("[connection:{}] actor stopped", self.name);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => ActorStep::Cmd(cmd),
                None => ActorStep::Stop,
            },
            Some(report) = self.report_rx.recv() => ActorStep::Report(report),
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) -> Flow {
        // ---
        match cmd {
            Cmd::Connect { resp } => self.on_connect(resp),
            Cmd::Close { resp } => self.on_close(resp),
            Cmd::Acquire { resp } => self.on_acquire(resp),
            Cmd::Destroy { resp } => {
                self.shutdown().await;
                let _ = resp.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn handle_report(&mut self, report: Report) {
        // ---
        match report {
            Report::Attempt { generation, result } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    if let Ok(stale) = result {
                        tokio::spawn(async move {
                            let _ = stale.close().await;
                        });
                    }
                    return;
                }
                match result {
                    Ok(connection) => self.on_connected(connection),
                    Err(err) => self.on_attempt_failed(err),
                }
            }
            Report::Lost { generation, error } => {
                if generation == self.generation && self.state == ConnectionState::Connected {
                    self.on_lost(error);
                }
            }
            Report::RetryElapsed { generation } => {
                if generation == self.generation && self.state == ConnectionState::Failed {
                    self.start_connecting();
                }
            }
            Report::Closed { generation } => {
                if generation == self.generation && self.state == ConnectionState::Closing {
                    self.on_closed();
                }
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        // ---
        if self.state != state {
            log_debug!("[connection:{}] {:?} -> {:?}", self.name, self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn track(&mut self, task: JoinHandle<()>) {
        // ---
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn in_transition(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Closing)
    }

    fn on_connect(&mut self, resp: oneshot::Sender<Result<()>>) {
        // ---
        match self.state {
            ConnectionState::Connected => {
                let _ = resp.send(Ok(()));
            }
            ConnectionState::Closing => self.deferred.push_back(Deferred::Connect(resp)),
            ConnectionState::Connecting | ConnectionState::Failed => self.waiters.push(resp),
            ConnectionState::Initializing | ConnectionState::Closed => {
                self.waiters.push(resp);
                self.failures = 0;
                self.start_connecting();
            }
        }
    }

    fn on_close(&mut self, resp: oneshot::Sender<Result<()>>) {
        // ---
        match self.state {
            ConnectionState::Initializing | ConnectionState::Closed => {
                self.set_state(ConnectionState::Closed);
                let _ = resp.send(Ok(()));
            }
            ConnectionState::Connecting | ConnectionState::Closing => {
                self.deferred.push_back(Deferred::Close(resp));
            }
            ConnectionState::Connected | ConnectionState::Failed => self.begin_close(resp),
        }
    }

    fn on_acquire(&mut self, resp: AcquireResp) {
        // ---
        let connect_pending = self
            .deferred
            .iter()
            .any(|d| matches!(d, Deferred::Connect(_)));

        match (&self.connection, self.state) {
            (Some(connection), ConnectionState::Connected) => {
                let _ = resp.send(Ok((Arc::clone(connection), self.epoch.load(Ordering::SeqCst))));
            }
            (_, ConnectionState::Closing) if connect_pending => self.acquirers.push(resp),
            (_, ConnectionState::Closing) | (_, ConnectionState::Closed) => {
                let _ = resp.send(Err(BusError::Closed(format!("connection '{}'", self.name))));
            }
            _ => self.acquirers.push(resp),
        }
    }

    fn start_connecting(&mut self) {
        // ---
        self.generation += 1;

        let Some(endpoint) = self.endpoints.get(self.index).cloned() else {
            let err = BusError::Config(format!("connection '{}' has no endpoints", self.name));
            log_error!("[connection:{}] {err}", self.name);
            self.fail_waiters(&err);
            self.set_state(ConnectionState::Closed);
            return;
        };

        self.set_state(ConnectionState::Connecting);
        log_debug!("[connection:{}] connecting to {}:{}", self.name, endpoint.host, endpoint.port);

        let broker = Arc::clone(&self.broker);
        let report = self.report_tx.clone();
        let generation = self.generation;

        self.track(tokio::spawn(async move {
            let result = broker.connect(&endpoint).await;
            let _ = report.send(Report::Attempt { generation, result });
        }));
    }

    fn on_connected(&mut self, connection: ConnectionPtr) {
        // ---
        self.failures = 0;
        self.backoff.reset();
        self.established = true;
        self.connection = Some(Arc::clone(&connection));

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connected);

        if self.ever_connected {
            log_info!("[connection:{}] reconnected (epoch {epoch})", self.name);
            self.emit(ConnectionEvent::Reconnected { epoch });
        } else {
            log_info!("[connection:{}] connected (epoch {epoch})", self.name);
            self.emit(ConnectionEvent::Connected { epoch });
        }
        self.ever_connected = true;

        // Loss watcher
        let report = self.report_tx.clone();
        let generation = self.generation;
        let watched = Arc::clone(&connection);
        self.track(tokio::spawn(async move {
            let error = watched.closed().await;
            let _ = report.send(Report::Lost { generation, error });
        }));

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        for acquirer in self.acquirers.drain(..) {
            let _ = acquirer.send(Ok((Arc::clone(&connection), epoch)));
        }

        self.replay_deferred();
    }

    fn on_attempt_failed(&mut self, err: BusError) {
        // ---
        self.failures += 1;
        log_warn!(
            "[connection:{}] connect attempt {} failed: {err}",
            self.name,
            self.failures
        );
        self.bump_index();
        self.emit(ConnectionEvent::Failed { error: err.clone() });

        if !self.established && self.failures >= self.attempt_limit {
            let exhausted = BusError::ConnectionExhausted {
                name: self.name.clone(),
                attempts: self.failures,
                last_error: err.to_string(),
            };
            log_error!("[connection:{}] {exhausted}", self.name);

            self.fail_waiters(&exhausted);
            self.failures = 0;
            self.backoff.reset();
            self.set_state(ConnectionState::Closed);
            self.emit(ConnectionEvent::Closed);
            self.replay_deferred();
            return;
        }

        self.set_state(ConnectionState::Failed);
        self.schedule_retry();
        self.replay_deferred();
    }

    fn on_lost(&mut self, error: BusError) {
        // ---
        log_warn!("[connection:{}] connection lost: {error}", self.name);
        self.connection = None;
        self.set_state(ConnectionState::Failed);
        self.emit(ConnectionEvent::Failed { error });
        self.schedule_retry();
    }

    /// Advance the endpoint index after a failed attempt.
    ///
    /// The index only moves forward while `index < limit - 1`; otherwise it
    /// goes back to the first endpoint.
    fn bump_index(&mut self) {
        // ---
        let limit = self.endpoints.len();
        if self.index < limit.saturating_sub(1) {
            self.index += 1;
        } else {
            self.index = 0;
        }
    }

    fn schedule_retry(&mut self) {
        // ---
        let delay = self.backoff.next_delay();
        log_debug!("[connection:{}] retrying in {delay:?}", self.name);

        let report = self.report_tx.clone();
        let generation = self.generation;
        self.cancel_retry();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = report.send(Report::RetryElapsed { generation });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.abort();
        }
    }

    fn begin_close(&mut self, resp: oneshot::Sender<Result<()>>) {
        // ---
        self.cancel_retry();
        self.generation += 1;
        self.established = false;
        self.set_state(ConnectionState::Closing);
        self.closing = Some(resp);

        let closed = BusError::Closed(format!("connection '{}'", self.name));
        self.fail_waiters(&closed);

        let owners = self.owners.take_all();
        let connection = self.connection.take();
        let report = self.report_tx.clone();
        let generation = self.generation;
        let name = self.name.clone();

        log_info!("[connection:{name}] closing ({} channels)", owners.len());

        self.track(tokio::spawn(async move {
            join_all(owners.iter().map(|owner| owner.teardown())).await;
            if let Some(connection) = connection {
                if let Err(_err) = connection.close().await {
                    log_warn!("[connection:{name}] close failed: {_err}");
                }
            }
            let _ = report.send(Report::Closed { generation });
        }));
    }

    fn on_closed(&mut self) {
        // ---
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed);
        log_info!("[connection:{}] closed", self.name);

        if let Some(resp) = self.closing.take() {
            let _ = resp.send(Ok(()));
        }
        self.replay_deferred();
    }

    fn replay_deferred(&mut self) {
        // ---
        while !self.in_transition() {
            let Some(next) = self.deferred.pop_front() else {
                break;
            };
            match next {
                Deferred::Connect(resp) => self.on_connect(resp),
                Deferred::Close(resp) => self.on_close(resp),
            }
        }
    }

    fn fail_waiters(&mut self, err: &BusError) {
        // ---
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for acquirer in self.acquirers.drain(..) {
            let _ = acquirer.send(Err(err.clone()));
        }
    }

    async fn shutdown(&mut self) {
        // ---
        self.generation += 1;
        self.cancel_retry();
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let destroyed = BusError::Destroyed(format!("connection '{}'", self.name));
        self.fail_waiters(&destroyed);
        for deferred in self.deferred.drain(..) {
            let resp = match deferred {
                Deferred::Connect(resp) | Deferred::Close(resp) => resp,
            };
            let _ = resp.send(Err(destroyed.clone()));
        }
        if let Some(resp) = self.closing.take() {
            let _ = resp.send(Err(destroyed.clone()));
        }

        let owners = self.owners.take_all();
        join_all(owners.iter().map(|owner| owner.teardown())).await;

        if let Some(connection) = self.connection.take() {
            if let Err(_err) = connection.close().await {
                log_warn!("[connection:{}] close failed: {_err}", self.name);
            }
        }

        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Destroyed);
        log_info!("[connection:{}] destroyed", self.name);
    }
}
