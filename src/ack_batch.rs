//! Batched message acknowledgement.
//!
//! A queue consuming with acknowledgements records every delivery here in
//! delivery order. Handlers mark their message as acked, nacked or rejected
//! whenever they finish, in any order. Resolution walks the ledger from the
//! head and turns each contiguous run of identically-resolved messages into a
//! single cumulative broker call (`tag = last tag of the run`,
//! `multiple = true`).
//!
//! Resolution stops at the first pending message: acknowledgements are
//! cumulative, so nothing past an unresolved tag may be sent.
//!
//! ## Driving resolution
//!
//! The batch owns no timer. Its owner calls [`AckBatch::signal`] on an
//! interval and [`AckBatch::flush`] on teardown; tests call them directly.
//! Only one pass runs at a time: a `signal` arriving mid-pass is ignored,
//! while `flush` waits for the running pass and then drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{BrokerChannel, Resolution};
use crate::{log_debug, log_error, log_warn, Result};

/// Broker-side sink for resolved acknowledgements.
#[async_trait::async_trait]
pub trait AckTarget: Send + Sync {
    // ---
    async fn settle(&self, resolution: Resolution, tag: u64, inclusive: bool) -> Result<()>;
}

#[async_trait::async_trait]
impl<C> AckTarget for C
where
    C: BrokerChannel + ?Sized,
{
    async fn settle(&self, resolution: Resolution, tag: u64, inclusive: bool) -> Result<()> {
        // ---
        match resolution {
            Resolution::Ack => self.ack(tag, inclusive).await,
            Resolution::Nack => self.nack(tag, inclusive, true).await,
            Resolution::Reject => self.reject(tag, inclusive).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Resolved(Resolution),
}

#[derive(Debug)]
struct Entry {
    tag: u64,
    status: Status,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: VecDeque<Entry>,
    // Bumped by reset(); a pass only trims entries from its own generation.
    generation: u64,
}

/// One contiguous same-status run at the head of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    resolution: Resolution,
    last_tag: u64,
    len: usize,
    generation: u64,
}

/// Ordered ledger of acknowledgement decisions for one queue.
#[derive(Debug)]
pub struct AckBatch {
    // ---
    name: String,
    ledger: Mutex<Ledger>,
    pass: tokio::sync::Mutex<()>,
    received: AtomicU64,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AckBatch {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        // ---
        Arc::new(Self {
            name: name.into(),
            ledger: Mutex::new(Ledger::default()),
            pass: tokio::sync::Mutex::new(()),
            received: AtomicU64::new(0),
        })
    }

    /// Record a newly delivered message as pending.
    pub fn add_message(&self, tag: u64) {
        // ---
        self.received.fetch_add(1, Ordering::Relaxed);

        let mut ledger = lock_ignore_poison(&self.ledger);
        if let Some(last) = ledger.entries.back() {
            if tag < last.tag {
                log_warn!(
                    "[{}] delivery tag {tag} arrived after tag {}; ordering not guaranteed",
                    self.name,
                    last.tag
                );
            }
        }
        ledger.entries.push_back(Entry {
            tag,
            status: Status::Pending,
        });
    }

    /// Mutators for one delivered message.
    ///
    /// The ops are bound to the current generation: once [`reset`](Self::reset)
    /// runs they no longer mark anything, even if the new channel reuses the tag.
    pub fn message_ops(self: &Arc<Self>, tag: u64) -> TagOps {
        // ---
        let generation = lock_ignore_poison(&self.ledger).generation;
        TagOps {
            batch: Arc::clone(self),
            tag,
            generation,
        }
    }

    /// Record the decision for `tag`. The first decision wins; returns false
    /// if the tag was already decided or is unknown.
    pub fn mark(&self, tag: u64, resolution: Resolution) -> bool {
        // ---
        let generation = lock_ignore_poison(&self.ledger).generation;
        self.mark_in(generation, tag, resolution)
    }

    fn mark_in(&self, generation: u64, tag: u64, resolution: Resolution) -> bool {
        // ---
        let mut ledger = lock_ignore_poison(&self.ledger);
        if ledger.generation != generation {
            log_debug!("[{}] ignoring decision for tag {tag} from a closed channel", self.name);
            return false;
        }
        match ledger.entries.iter_mut().find(|entry| entry.tag == tag) {
            Some(entry) if entry.status == Status::Pending => {
                entry.status = Status::Resolved(resolution);
                true
            }
            _ => false,
        }
    }

    /// Total messages ever added.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages still in the ledger, resolved or not.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.ledger).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages whose handler has not decided yet.
    pub fn pending_count(&self) -> usize {
        // ---
        lock_ignore_poison(&self.ledger)
            .entries
            .iter()
            .filter(|entry| entry.status == Status::Pending)
            .count()
    }

    /// Periodic resolution. Ignored while another pass is running.
    ///
    /// Returns the number of broker calls issued.
    pub async fn signal<T>(&self, target: &T) -> usize
    where
        T: AckTarget + ?Sized,
    {
        // ---
        let Ok(_pass) = self.pass.try_lock() else {
            log_debug!("[{}] ack pass already running", self.name);
            return 0;
        };
        self.resolve(target).await
    }

    /// Drain everything resolvable, waiting for any running pass first.
    ///
    /// Warns when pending messages remain; they cannot be acknowledged and
    /// are left for redelivery.
    pub async fn flush<T>(&self, target: &T) -> usize
    where
        T: AckTarget + ?Sized,
    {
        // ---
        let _pass = self.pass.lock().await;
        let calls = self.resolve(target).await;

        let pending = self.pending_count();
        if pending > 0 {
            log_warn!(
                "[{}] flush left {pending} unresolved message(s); they will be redelivered",
                self.name
            );
        }
        calls
    }

    /// Forget every entry. Used when the channel the tags belong to is gone.
    ///
    /// Returns the number of discarded entries.
    pub fn reset(&self) -> usize {
        // ---
        let mut ledger = lock_ignore_poison(&self.ledger);
        let discarded = ledger.entries.len();
        let pending = ledger
            .entries
            .iter()
            .filter(|entry| entry.status == Status::Pending)
            .count();

        ledger.entries.clear();
        ledger.generation += 1;

        if discarded > 0 {
            log_warn!(
                "[{}] discarded {discarded} acknowledgement(s) ({pending} pending) from a closed channel",
                self.name
            );
        }
        discarded
    }

    async fn resolve<T>(&self, target: &T) -> usize
    where
        T: AckTarget + ?Sized,
    {
        // ---
        let mut calls = 0;

        while let Some(run) = self.head_run() {
            let result = target.settle(run.resolution, run.last_tag, true).await;
            calls += 1;

            match result {
                Ok(()) => {
                    log_debug!(
                        "[{}] {} up to tag {} ({} message(s))",
                        self.name,
                        run.resolution.as_str(),
                        run.last_tag,
                        run.len
                    );
                    self.trim(run);
                }
                Err(err) => {
                    log_error!(
                        "[{}] {} up to tag {} failed: {err}",
                        self.name,
                        run.resolution.as_str(),
                        run.last_tag
                    );
                    break;
                }
            }
        }

        calls
    }

    fn head_run(&self) -> Option<Run> {
        // ---
        let ledger = lock_ignore_poison(&self.ledger);
        let head = ledger.entries.front()?;
        let Status::Resolved(resolution) = head.status else {
            return None;
        };

        let mut run = Run {
            resolution,
            last_tag: head.tag,
            len: 0,
            generation: ledger.generation,
        };
        for entry in ledger.entries.iter() {
            if entry.status != head.status {
                break;
            }
            run.last_tag = entry.tag;
            run.len += 1;
        }
        Some(run)
    }

    fn trim(&self, run: Run) {
        // ---
        let mut ledger = lock_ignore_poison(&self.ledger);
        if ledger.generation != run.generation {
            return;
        }
        let len = run.len.min(ledger.entries.len());
        ledger.entries.drain(..len);
    }
}

/// Ack/nack/reject mutators bound to one delivery tag.
#[derive(Debug, Clone)]
pub struct TagOps {
    batch: Arc<AckBatch>,
    tag: u64,
    generation: u64,
}

impl TagOps {
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn ack(&self) -> bool {
        self.batch.mark_in(self.generation, self.tag, Resolution::Ack)
    }

    pub fn nack(&self) -> bool {
        self.batch.mark_in(self.generation, self.tag, Resolution::Nack)
    }

    pub fn reject(&self) -> bool {
        self.batch.mark_in(self.generation, self.tag, Resolution::Reject)
    }

    pub fn resolve(&self, resolution: Resolution) -> bool {
        self.batch.mark_in(self.generation, self.tag, resolution)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::BusError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Resolution, u64, bool)>>,
        fail: AtomicBool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(Resolution, u64, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl AckTarget for Recorder {
        async fn settle(&self, resolution: Resolution, tag: u64, inclusive: bool) -> Result<()> {
            // ---
            if self.fail.load(Ordering::SeqCst) {
                return Err(BusError::Ack("broker said no".into()));
            }
            self.calls.lock().unwrap().push((resolution, tag, inclusive));
            Ok(())
        }
    }

    fn batch_with(tags: &[u64]) -> Arc<AckBatch> {
        // ---
        let batch = AckBatch::new("test");
        for tag in tags {
            batch.add_message(*tag);
        }
        batch
    }

    #[tokio::test]
    async fn test_in_order_acks_collapse_to_one_call() {
        // ---
        let batch = batch_with(&[1, 2, 3]);
        let target = Recorder::default();

        for tag in 1..=3 {
            assert!(batch.message_ops(tag).ack());
        }

        assert_eq!(batch.signal(&target).await, 1);
        assert_eq!(target.calls(), vec![(Resolution::Ack, 3, true)]);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_pending_tag_blocks_later_tags() {
        // ---
        let batch = batch_with(&[1, 2, 3]);
        let target = Recorder::default();

        batch.message_ops(1).ack();
        batch.message_ops(3).ack();
        batch.signal(&target).await;

        // Only the resolved prefix goes out; tag 3 waits behind tag 2.
        assert_eq!(target.calls(), vec![(Resolution::Ack, 1, true)]);
        assert_eq!(batch.len(), 2);

        batch.signal(&target).await;
        assert_eq!(target.calls().len(), 1);

        batch.message_ops(2).ack();
        batch.signal(&target).await;
        assert_eq!(
            target.calls(),
            vec![(Resolution::Ack, 1, true), (Resolution::Ack, 3, true)]
        );
    }

    #[tokio::test]
    async fn test_pending_head_issues_nothing() {
        // ---
        let batch = batch_with(&[1, 2, 3]);
        let target = Recorder::default();

        batch.message_ops(2).ack();
        batch.message_ops(3).ack();

        assert_eq!(batch.signal(&target).await, 0);
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_resolution() {
        // ---
        let batch = batch_with(&[1, 2, 3]);
        let target = Recorder::default();

        batch.message_ops(1).ack();
        batch.message_ops(2).ack();
        batch.message_ops(3).nack();

        assert_eq!(batch.signal(&target).await, 2);
        assert_eq!(
            target.calls(),
            vec![(Resolution::Ack, 2, true), (Resolution::Nack, 3, true)]
        );
    }

    #[tokio::test]
    async fn test_reject_run() {
        // ---
        let batch = batch_with(&[4, 5, 6]);
        let target = Recorder::default();

        batch.message_ops(4).reject();
        batch.message_ops(5).reject();
        batch.message_ops(6).ack();

        batch.flush(&target).await;
        assert_eq!(
            target.calls(),
            vec![(Resolution::Reject, 5, true), (Resolution::Ack, 6, true)]
        );
    }

    #[tokio::test]
    async fn test_first_decision_wins() {
        // ---
        let batch = batch_with(&[1]);
        let ops = batch.message_ops(1);

        assert!(ops.nack());
        assert!(!ops.ack());
        assert!(!ops.reject());

        let target = Recorder::default();
        batch.flush(&target).await;
        assert_eq!(target.calls(), vec![(Resolution::Nack, 1, true)]);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        // ---
        let batch = AckBatch::new("empty");
        let target = Recorder::default();

        assert_eq!(batch.flush(&target).await, 0);
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flush_leaves_pending_messages() {
        // ---
        let batch = batch_with(&[1, 2]);
        let target = Recorder::default();
        batch.message_ops(1).ack();

        batch.flush(&target).await;
        assert_eq!(target.calls(), vec![(Resolution::Ack, 1, true)]);
        assert_eq!(batch.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_call_keeps_entries() {
        // ---
        let batch = batch_with(&[1, 2]);
        let target = Recorder::default();
        batch.message_ops(1).ack();
        batch.message_ops(2).ack();

        target.fail.store(true, Ordering::SeqCst);
        assert_eq!(batch.signal(&target).await, 1);
        assert_eq!(batch.len(), 2);

        target.fail.store(false, Ordering::SeqCst);
        batch.signal(&target).await;
        assert_eq!(target.calls(), vec![(Resolution::Ack, 2, true)]);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_signal_ignored_during_pass() {
        // ---
        let batch = batch_with(&[1]);
        batch.message_ops(1).ack();
        let target = Recorder::default();

        let guard = batch.pass.lock().await;
        assert_eq!(batch.signal(&target).await, 0);
        drop(guard);

        assert_eq!(batch.signal(&target).await, 1);
    }

    #[tokio::test]
    async fn test_reset_discards_entries() {
        // ---
        let batch = batch_with(&[1, 2, 3]);
        batch.message_ops(1).ack();

        assert_eq!(batch.reset(), 3);
        assert!(batch.is_empty());
        assert_eq!(batch.received_count(), 3);

        let target = Recorder::default();
        assert_eq!(batch.flush(&target).await, 0);
    }

    #[tokio::test]
    async fn test_ops_from_before_reset_do_not_mark_reused_tag() {
        // ---
        let batch = batch_with(&[1]);
        let old = batch.message_ops(1);

        batch.reset();
        batch.add_message(1);

        assert!(!old.reject());
        assert_eq!(batch.pending_count(), 1);

        let target = Recorder::default();
        assert_eq!(batch.signal(&target).await, 0);

        assert!(batch.message_ops(1).ack());
        batch.signal(&target).await;
        assert_eq!(target.calls(), vec![(Resolution::Ack, 1, true)]);
    }
}
