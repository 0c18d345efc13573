// src/resource.rs

//! Channel resource: a lazily (re)acquired broker channel.
//!
//! A [`ChannelResource`] wraps one logical channel on a [`Connection`]. It
//! gives every caller the same `get`/`operate` semantics no matter whether
//! the channel is currently open:
//!
//! - While not `acquired`, deferrable requests queue up and are answered in
//!   FIFO order once a channel is acquired. Non-deferrable requests fail
//!   fast with [`BusError::NotReady`].
//! - A failed acquire is retried with the connection's backoff policy.
//! - A channel closed by the broker moves the resource to `released`; the next
//!   request re-acquires it.
//! - `destroy()` is never queued and is terminal.
//!
//! Owners observe releases through [`ChannelResource::watch`]. Each acquired
//! channel carries a *generation*, so owners can tell a release of the
//! channel they are using from a stale one.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[allow(unused_imports)]
use crate::{
    // ---
    connection::{Connection, Teardown},
    domain::ChannelPtr,
    log_debug,
    log_warn,
    retry::Backoff,
    BusError,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Acquiring,
    Acquired,
    Released,
    Failed,
    Destroyed,
}

/// Observable resource status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStatus {
    pub state: ResourceState,
    /// Generation of the most recently acquired channel; 0 before the first.
    pub generation: u64,
}

/// An acquired channel.
#[derive(Clone)]
pub struct Lease {
    pub channel: ChannelPtr,
    /// Connection epoch the channel was opened on.
    pub epoch: u64,
    pub generation: u64,
}

//
// Actor commands
//

enum Cmd {
    //
    Get {
        deferrable: bool,
        resp: oneshot::Sender<Result<Lease>>,
    },
    Release {
        resp: oneshot::Sender<()>,
    },
    Destroy {
        resp: oneshot::Sender<()>,
    },
}

enum Report {
    //
    Acquired {
        attempt: u64,
        result: Result<(ChannelPtr, u64)>,
    },
    Closed {
        generation: u64,
        error: BusError,
    },
    RetryElapsed {
        attempt: u64,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Report(Report),
    Stop,
}

/// Handle to a channel resource. Cheap to clone.
#[derive(Clone)]
pub struct ChannelResource {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    name: String,
    cmd_tx: mpsc::Sender<Cmd>,
    status_rx: watch::Receiver<ResourceStatus>,
}

impl ChannelResource {
    /// Create a resource on `connection` and start acquiring its channel.
    ///
    /// The resource registers itself with the connection, which tears it
    /// down on close.
    pub async fn new(name: impl Into<String>, connection: &Connection, confirm: bool) -> Self {
        // ---
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ResourceStatus {
            state: ResourceState::Acquiring,
            generation: 0,
        });

        let resource = Self {
            inner: Arc::new(Inner {
                name: name.clone(),
                cmd_tx,
                status_rx,
            }),
        };
        let owner_id = connection.register(Arc::new(resource.clone()));

        let mut actor = Actor {
            name,
            owner_id,
            connection: connection.clone(),
            confirm,
            state: ResourceState::Acquiring,
            generation: 0,
            status_tx,
            lease: None,
            deferred: VecDeque::new(),
            backoff: Backoff::new(connection.config().backoff),
            attempt: 0,
            cmd_rx,
            report_tx,
            report_rx,
            tasks: Vec::new(),
        };
        actor.start_acquire();
        tokio::spawn(actor.run());

        resource
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ResourceStatus {
        *self.inner.status_rx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ResourceStatus> {
        self.inner.status_rx.clone()
    }

    fn destroyed(&self) -> BusError {
        BusError::Destroyed(format!("channel '{}'", self.inner.name))
    }

    /// The acquired channel.
    ///
    /// When not acquired, a `deferrable` request waits for the next acquire;
    /// otherwise it fails with [`BusError::NotReady`].
    pub async fn get(&self, deferrable: bool) -> Result<Lease> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Cmd::Get {
                deferrable,
                resp: tx,
            })
            .await
            .map_err(|_| self.destroyed())?;

        rx.await.map_err(|_| self.destroyed())?
    }

    /// Run `op` against the channel, deferring until one is acquired.
    pub async fn operate<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnOnce(ChannelPtr) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        let lease = self.get(true).await?;
        log_debug!("[{}] {operation}", self.inner.name);
        op(lease.channel).await
    }

    /// Close the current channel. The next request acquires a new one.
    pub async fn release(&self) {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Cmd::Release { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Close the channel and stop the resource. Pending and later requests
    /// fail with [`BusError::Destroyed`].
    pub async fn destroy(&self) {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Cmd::Destroy { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[async_trait::async_trait]
impl Teardown for ChannelResource {
    async fn teardown(&self) {
        self.destroy().await;
    }
}

/// Background actor that owns the channel.
struct Actor {
    // ---
    name: String, // for logging only
    owner_id: u64,
    connection: Connection,
    confirm: bool,

    state: ResourceState,
    generation: u64,
    status_tx: watch::Sender<ResourceStatus>,

    lease: Option<Lease>,
    deferred: VecDeque<oneshot::Sender<Result<Lease>>>,
    backoff: Backoff,
    /// Bumped per acquire attempt; older reports are ignored.
    attempt: u64,

    cmd_rx: mpsc::Receiver<Cmd>,
    report_tx: mpsc::UnboundedSender<Report>,
    report_rx: mpsc::UnboundedReceiver<Report>,
    tasks: Vec<JoinHandle<()>>,
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
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Get { deferrable, resp } => self.on_get(deferrable, resp),
            Cmd::Release { resp } => {
                self.release().await;
                let _ = resp.send(());
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
            Report::Acquired { attempt, result } => {
                if attempt != self.attempt || self.state != ResourceState::Acquiring {
                    if let Ok((stale, _)) = result {
                        tokio::spawn(async move {
                            let _ = stale.close().await;
                        });
                    }
                    return;
                }
                match result {
                    Ok((channel, epoch)) => self.on_acquired(channel, epoch),
                    Err(err) => self.on_acquire_failed(err),
                }
            }
            Report::Closed { generation, error } => {
                if generation == self.generation && self.state == ResourceState::Acquired {
                    log_debug!("[{}] channel closed: {error}", self.name);
                    self.lease = None;
                    self.set_state(ResourceState::Released);
                }
            }
            Report::RetryElapsed { attempt } => {
                if attempt == self.attempt && self.state == ResourceState::Failed {
                    self.start_acquire();
                }
            }
        }
    }

    fn set_state(&mut self, state: ResourceState) {
        // ---
        self.state = state;
        self.status_tx.send_replace(ResourceStatus {
            state,
            generation: self.generation,
        });
    }

    fn track(&mut self, task: JoinHandle<()>) {
        // ---
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn on_get(&mut self, deferrable: bool, resp: oneshot::Sender<Result<Lease>>) {
        // ---
        if self.state == ResourceState::Acquired {
            if let Some(lease) = &self.lease {
                let _ = resp.send(Ok(lease.clone()));
                return;
            }
        }

        if self.state == ResourceState::Destroyed {
            let _ = resp.send(Err(BusError::Destroyed(format!("channel '{}'", self.name))));
            return;
        }

        if !deferrable {
            let _ = resp.send(Err(BusError::NotReady(format!("channel '{}'", self.name))));
            return;
        }

        self.deferred.push_back(resp);
        if self.state == ResourceState::Released {
            self.start_acquire();
        }
    }

    fn start_acquire(&mut self) {
        // ---
        self.attempt += 1;
        self.set_state(ResourceState::Acquiring);

        let connection = self.connection.clone();
        let confirm = self.confirm;
        let report = self.report_tx.clone();
        let attempt = self.attempt;

        self.track(tokio::spawn(async move {
            let result = async {
                let (conn, epoch) = connection.acquire().await?;
                let channel = conn.create_channel(confirm).await?;
                Ok::<_, BusError>((channel, epoch))
            }
            .await;
            let _ = report.send(Report::Acquired { attempt, result });
        }));
    }

    fn on_acquired(&mut self, channel: ChannelPtr, epoch: u64) {
        // ---
        self.generation += 1;
        self.backoff.reset();

        let lease = Lease {
            channel: Arc::clone(&channel),
            epoch,
            generation: self.generation,
        };
        self.lease = Some(lease.clone());
        self.set_state(ResourceState::Acquired);
        log_debug!("[{}] acquired (generation {})", self.name, self.generation);

        let report = self.report_tx.clone();
        let generation = self.generation;
        self.track(tokio::spawn(async move {
            let error = channel.closed().await;
            let _ = report.send(Report::Closed { generation, error });
        }));

        for waiter in self.deferred.drain(..) {
            let _ = waiter.send(Ok(lease.clone()));
        }
    }

    fn on_acquire_failed(&mut self, err: BusError) {
        // ---
        if !err.is_transient() {
            log_debug!("[{}] acquire abandoned: {err}", self.name);
            for waiter in self.deferred.drain(..) {
                let _ = waiter.send(Err(err.clone()));
            }
            self.set_state(ResourceState::Released);
            return;
        }

        let delay = self.backoff.next_delay();
        log_warn!("[{}] acquire failed, retrying in {delay:?}: {err}", self.name);
        self.set_state(ResourceState::Failed);

        let report = self.report_tx.clone();
        let attempt = self.attempt;
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = report.send(Report::RetryElapsed { attempt });
        }));
    }

    async fn release(&mut self) {
        // ---
        if let Some(lease) = self.lease.take() {
            log_debug!("[{}] releasing generation {}", self.name, lease.generation);
            let _ = lease.channel.close().await;
            self.set_state(ResourceState::Released);
        }
    }

    async fn shutdown(&mut self) {
        // ---
        self.attempt += 1;
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(lease) = self.lease.take() {
            let _ = lease.channel.close().await;
        }

        let destroyed = BusError::Destroyed(format!("channel '{}'", self.name));
        for waiter in self.deferred.drain(..) {
            let _ = waiter.send(Err(destroyed.clone()));
        }

        self.set_state(ResourceState::Destroyed);
        self.connection.unregister(self.owner_id);
        log_debug!("[{}] destroyed", self.name);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use super::*;
    use crate::{create_memory_broker, ConnectionConfig, MemoryBroker};

    fn connection(broker: &MemoryBroker) -> Connection {
        // ---
        Connection::new(
            ConnectionConfig::with_servers("test", ["localhost"]),
            create_memory_broker(broker),
        )
    }

    async fn wait_state(resource: &ChannelResource, state: ResourceState) -> ResourceStatus {
        // ---
        let mut rx = resource.watch();
        let status = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
            .await
            .expect("state timeout")
            .expect("resource gone");
        *status
    }

    #[tokio::test]
    async fn test_get_defers_until_connected() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        let resource = ChannelResource::new("test-channel", &conn, false).await;

        let deferred = tokio::spawn({
            let resource = resource.clone();
            async move { resource.get(true).await.map(|lease| lease.generation) }
        });

        assert!(matches!(resource.get(false).await, Err(BusError::NotReady(_))));

        conn.connect().await.unwrap();
        assert_eq!(deferred.await.unwrap(), Ok(1));
        assert_eq!(resource.get(false).await.unwrap().epoch, 1);
    }

    #[tokio::test]
    async fn test_broker_close_releases_and_reacquires() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        conn.connect().await.unwrap();
        let resource = ChannelResource::new("test-channel", &conn, false).await;
        assert_eq!(resource.get(true).await.unwrap().generation, 1);

        broker.close_all_channels();
        let status = wait_state(&resource, ResourceState::Released).await;
        assert_eq!(status.generation, 1);

        let lease = resource.get(true).await.unwrap();
        assert_eq!(lease.generation, 2);
        assert_eq!(broker.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_operate_runs_against_channel() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        conn.connect().await.unwrap();
        let resource = ChannelResource::new("test-channel", &conn, false).await;

        let depth = resource
            .operate("declare", |channel| async move {
                channel
                    .declare_queue(&crate::domain::QueueDef {
                        name: "q".into(),
                        durable: false,
                        auto_delete: false,
                        exclusive: false,
                        dead_letter: None,
                        max_length: None,
                    })
                    .await
            })
            .await
            .unwrap();

        assert_eq!(depth, 0);
        assert!(broker.has_queue("q"));
    }

    #[tokio::test]
    async fn test_destroy_fails_deferred_requests() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        let resource = ChannelResource::new("test-channel", &conn, false).await;

        let deferred = tokio::spawn({
            let resource = resource.clone();
            async move { resource.get(true).await.map(|_| ()) }
        });
        tokio::task::yield_now().await;

        resource.destroy().await;

        assert!(matches!(deferred.await.unwrap(), Err(BusError::Destroyed(_))));
        assert!(matches!(resource.get(true).await, Err(BusError::Destroyed(_))));
        assert_eq!(resource.status().state, ResourceState::Destroyed);
    }

    #[tokio::test]
    async fn test_connection_close_destroys_resource() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        conn.connect().await.unwrap();
        let resource = ChannelResource::new("test-channel", &conn, false).await;
        resource.get(true).await.unwrap();

        conn.close().await.unwrap();

        assert_eq!(resource.status().state, ResourceState::Destroyed);
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_replaced_resource_with_same_name_is_still_torn_down() {
        // ---
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        conn.connect().await.unwrap();

        let old = ChannelResource::new("queue:work", &conn, false).await;
        let new = ChannelResource::new("queue:work", &conn, false).await;
        old.get(true).await.unwrap();
        new.get(true).await.unwrap();

        old.destroy().await;
        conn.close().await.unwrap();

        assert_eq!(new.status().state, ResourceState::Destroyed);
        assert_eq!(broker.channel_count(), 0);
    }
}
