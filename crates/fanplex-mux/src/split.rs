//! Fan-out: broadcast one conduit to a runtime-sized set of outputs.
//!
//! A distributor task reads the input and pushes a clone of every value onto
//! one queue per output without waiting. Each output has a dedicated lane
//! task moving its queue into the output conduit, so a slow or absent reader
//! only ever stalls its own lane.
//!
//! When the input closes the distributor drops the queues; each lane delivers
//! whatever is still queued and only then closes its output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use fanplex_core::{Overflow, QueuePolicy, Result, SplitConfig};

use crate::conduit::{self, Receiver, Sender, TrySendError};
use crate::session::{self, Completion, SessionOutcome, WorkerExit};

/// Broadcast `input` to every one of `outputs` with the default configuration.
///
/// Outputs close after the input closes and their lane has delivered every
/// value. With no outputs the input is still read to the end.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn split<T, O>(input: Receiver<T>, outputs: O)
where
    T: Clone + Send + 'static,
    O: IntoIterator<Item = Sender<T>>,
{
    Split::new(SplitConfig::default()).spawn(input, outputs);
}

/// Builder for a fan-out session.
#[derive(Debug, Clone)]
pub struct Split {
    config: SplitConfig,
    name: Arc<str>,
    cancel: Option<CancellationToken>,
}

impl Split {
    pub fn new(config: SplitConfig) -> Self {
        Self {
            config,
            name: Arc::from("split"),
            cancel: None,
        }
    }

    /// Label used in log fields.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Run the session under a child of `token`.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Start broadcasting. The session takes ownership of `outputs` and is
    /// the only party that closes them.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<T, O>(self, input: Receiver<T>, outputs: O) -> SplitHandle
    where
        T: Clone + Send + 'static,
        O: IntoIterator<Item = Sender<T>>,
    {
        let outputs: Vec<Sender<T>> = outputs.into_iter().collect();
        let counters = Arc::new(SplitCounters::new(outputs.len()));
        let cancel = session::session_token(self.cancel.as_ref());

        info!(
            session = %self.name,
            outputs = outputs.len(),
            queue_capacity = ?self.config.queue.capacity(),
            overflow = ?self.config.queue.overflow(),
            "Split session started"
        );

        let mut lanes = Vec::with_capacity(outputs.len());
        let mut workers = Vec::with_capacity(outputs.len() + 1);
        for (index, output) in outputs.into_iter().enumerate() {
            let (queue_tx, queue_rx) = match self.config.queue {
                QueuePolicy::Unbounded => conduit::unbounded(),
                QueuePolicy::Bounded { capacity, .. } => conduit::bounded(capacity),
            };
            let detached = Arc::new(AtomicBool::new(false));
            lanes.push(Lane {
                index,
                queue: Some(queue_tx),
                detached: Arc::clone(&detached),
            });
            workers.push(tokio::spawn(deliver(LaneWorker {
                session: Arc::clone(&self.name),
                index,
                queue: queue_rx,
                output,
                detached,
                counters: Arc::clone(&counters),
                cancel: cancel.clone(),
            })));
        }

        workers.push(tokio::spawn(distribute(Distributor {
            session: Arc::clone(&self.name),
            input,
            lanes,
            overflow: self.config.queue.overflow().unwrap_or_default(),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        })));

        let completion = session::supervise("split", Arc::clone(&self.name), workers, fold_outcome);

        SplitHandle {
            counters,
            cancel,
            completion,
        }
    }
}

impl Default for Split {
    fn default() -> Self {
        Self::new(SplitConfig::default())
    }
}

/// Cloneable control handle for a fan-out session.
#[derive(Debug, Clone)]
pub struct SplitHandle {
    counters: Arc<SplitCounters>,
    cancel: CancellationToken,
    completion: Completion,
}

impl SplitHandle {
    pub fn stats(&self) -> SplitStats {
        let c = &self.counters;
        SplitStats {
            outputs: c.outputs,
            open_outputs: c.open_outputs.load(Ordering::Acquire),
            detached: c.detached.load(Ordering::Acquire),
            received: c.received.load(Ordering::Acquire),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop reading the input and close every output. Values still queued
    /// for an output are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to end.
    pub async fn wait(&self) -> Result<SessionOutcome> {
        self.completion.wait().await
    }

    /// Outcome, if the session already ended.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.completion.outcome()
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }
}

/// Point-in-time counters of a fan-out session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitStats {
    /// Outputs the session started with.
    pub outputs: usize,
    /// Outputs not closed yet.
    pub open_outputs: usize,
    /// Outputs no longer fed, because their reader left or they overflowed.
    pub detached: usize,
    /// Values read from the input and offered to every attached output.
    pub received: u64,
    /// Values written to outputs, summed over outputs.
    pub delivered: u64,
    /// Values discarded for a full output queue.
    pub dropped: u64,
}

#[derive(Debug)]
struct SplitCounters {
    outputs: usize,
    open_outputs: AtomicUsize,
    detached: AtomicUsize,
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SplitCounters {
    fn new(outputs: usize) -> Self {
        Self {
            outputs,
            open_outputs: AtomicUsize::new(outputs),
            detached: AtomicUsize::new(0),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Count a lane as detached once, whichever side notices first.
    fn mark_detached(&self, flag: &AtomicBool) -> bool {
        let first = !flag.swap(true, Ordering::AcqRel);
        if first {
            self.detached.fetch_add(1, Ordering::AcqRel);
        }
        first
    }
}

/// Distributor-side view of one output.
struct Lane<T> {
    index: usize,
    /// `None` once the lane is detached.
    queue: Option<Sender<T>>,
    detached: Arc<AtomicBool>,
}

struct Distributor<T> {
    session: Arc<str>,
    input: Receiver<T>,
    lanes: Vec<Lane<T>>,
    overflow: Overflow,
    counters: Arc<SplitCounters>,
    cancel: CancellationToken,
}

async fn distribute<T: Clone>(distributor: Distributor<T>) -> WorkerExit {
    let Distributor {
        session,
        mut input,
        mut lanes,
        overflow,
        counters,
        cancel,
    } = distributor;

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break WorkerExit::Cancelled,
            next = input.recv() => {
                let Some(value) = next else {
                    break WorkerExit::Exhausted;
                };
                offer(&session, &mut lanes, &value, overflow, &counters);
                counters.received.fetch_add(1, Ordering::AcqRel);
            }
        }
    };

    debug!(
        session = %session,
        ?exit,
        received = counters.received.load(Ordering::Acquire),
        "Split input finished"
    );
    // Closing the queues lets every lane finish delivering and close its output.
    drop(lanes);
    exit
}

fn offer<T: Clone>(
    session: &str,
    lanes: &mut [Lane<T>],
    value: &T,
    overflow: Overflow,
    counters: &SplitCounters,
) {
    for lane in lanes.iter_mut() {
        let Some(queue) = &lane.queue else {
            continue;
        };
        match queue.try_send(value.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => match overflow {
                Overflow::DropNewest => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(session, output = lane.index, "Split queue full, value dropped");
                }
                Overflow::Detach => {
                    lane.queue = None;
                    if counters.mark_detached(&lane.detached) {
                        warn!(session, output = lane.index, "Split queue full, output detached");
                    }
                }
            },
            Err(TrySendError::Disconnected(_)) => {
                // The lane already exited and counted itself.
                lane.queue = None;
            }
        }
    }
}

struct LaneWorker<T> {
    session: Arc<str>,
    index: usize,
    queue: Receiver<T>,
    output: Sender<T>,
    detached: Arc<AtomicBool>,
    counters: Arc<SplitCounters>,
    cancel: CancellationToken,
}

async fn deliver<T>(worker: LaneWorker<T>) -> WorkerExit {
    let LaneWorker {
        session,
        index,
        mut queue,
        output,
        detached,
        counters,
        cancel,
    } = worker;

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break WorkerExit::Cancelled,
            () = output.disconnected() => break WorkerExit::Detached,
            next = queue.recv() => {
                let Some(value) = next else {
                    break WorkerExit::Exhausted;
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break WorkerExit::Cancelled,
                    sent = output.send(value) => {
                        if sent.is_err() {
                            break WorkerExit::Detached;
                        }
                    }
                }
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    if exit == WorkerExit::Detached && counters.mark_detached(&detached) {
        debug!(session = %session, output = index, "Split output reader gone, detached");
    }
    counters.open_outputs.fetch_sub(1, Ordering::AcqRel);
    debug!(session = %session, output = index, ?exit, "Split output closed");
    exit
}

fn fold_outcome(exits: &[WorkerExit]) -> SessionOutcome {
    if exits.contains(&WorkerExit::Cancelled) {
        SessionOutcome::Cancelled
    } else {
        SessionOutcome::Completed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::conduit::{bounded, unbounded};

    const WAIT: Duration = Duration::from_secs(5);

    fn bounded_queue(overflow: Overflow) -> SplitConfig {
        SplitConfig {
            queue: QueuePolicy::Bounded {
                capacity: 1,
                overflow,
            },
        }
    }

    /// Wait until the distributor has taken `n` values off the input.
    async fn until_received(handle: &SplitHandle, n: u64) {
        timeout(WAIT, async {
            while handle.stats().received < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("distributor stalled");
    }

    #[tokio::test]
    async fn zero_outputs_still_consume_input() {
        let (tx, rx) = bounded(1);
        let handle = Split::default().spawn(rx, Vec::<Sender<u32>>::new());

        timeout(WAIT, async {
            for i in 0..100 {
                tx.send(i).await.unwrap();
            }
        })
        .await
        .expect("producer blocked");
        tx.close();

        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Completed);
        assert_eq!(handle.stats().received, 100);
        assert_eq!(handle.stats().delivered, 0);
    }

    #[tokio::test]
    async fn every_output_sees_input_order() {
        let (tx, rx) = unbounded();
        let (outputs, readers): (Vec<_>, Vec<_>) = (0..5).map(|_| unbounded()).unzip();
        let handle = Split::default().with_name("order").spawn(rx, outputs);

        for i in 0..50 {
            tx.send(i).await.unwrap();
        }
        tx.close();

        for reader in readers {
            let seen: Vec<u32> = timeout(WAIT, reader.collect()).await.unwrap();
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Completed);

        let stats = handle.stats();
        assert_eq!(stats.open_outputs, 0);
        assert_eq!(stats.delivered, 250);
    }

    #[tokio::test]
    async fn queued_values_are_delivered_before_close() {
        let (tx, rx) = unbounded();
        let (out_tx, mut out_rx) = bounded(1);
        let handle = Split::default().spawn(rx, [out_tx]);

        for i in 0..50 {
            tx.send(i).await.unwrap();
        }
        tx.close();
        until_received(&handle, 50).await;

        for expected in 0..50 {
            assert_eq!(timeout(WAIT, out_rx.recv()).await.unwrap(), Some(expected));
        }
        assert_eq!(timeout(WAIT, out_rx.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unread_output_does_not_block_others() {
        let (tx, rx) = unbounded();
        let (fast_a, read_a) = unbounded();
        let (fast_b, read_b) = unbounded();
        let (stuck, mut never_read) = bounded(1);
        let handle = Split::default().spawn(rx, [fast_a, fast_b, stuck]);

        for i in 0..100 {
            tx.send(i).await.unwrap();
        }
        tx.close();

        for reader in [read_a, read_b] {
            let seen: Vec<u32> = timeout(WAIT, reader.collect()).await.unwrap();
            assert_eq!(seen.len(), 100);
        }
        assert!(!handle.is_finished());
        assert_eq!(handle.stats().open_outputs, 1);

        handle.cancel();
        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert_eq!(never_read.recv().await, Some(0));
        assert_eq!(never_read.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_reader_is_detached() {
        let (tx, rx) = unbounded();
        let (kept, reader) = unbounded();
        let (gone, gone_reader) = unbounded::<u32>();
        drop(gone_reader);
        let handle = Split::default().spawn(rx, [kept, gone]);

        for i in 0..10 {
            tx.send(i).await.unwrap();
        }
        tx.close();

        let seen: Vec<u32> = timeout(WAIT, reader.collect()).await.unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Completed);
        assert_eq!(handle.stats().detached, 1);
    }

    #[tokio::test]
    async fn drop_newest_discards_for_lagging_output_only() {
        let (tx, rx) = unbounded();
        let (fast, mut fast_reader) = unbounded();
        let (slow, slow_reader) = bounded(1);
        let handle = Split::new(bounded_queue(Overflow::DropNewest)).spawn(rx, [fast, slow]);

        // Pace the producer on the fast reader so only the slow lane backs up.
        for i in 0..10 {
            tx.send(i).await.unwrap();
            assert_eq!(timeout(WAIT, fast_reader.recv()).await.unwrap(), Some(i));
        }
        tx.close();
        until_received(&handle, 10).await;

        let slow_seen: Vec<u32> = timeout(WAIT, slow_reader.collect()).await.unwrap();
        assert!((1..=3).contains(&slow_seen.len()), "slow saw {slow_seen:?}");
        assert!(slow_seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(timeout(WAIT, fast_reader.recv()).await.unwrap(), None);

        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Completed);
        let stats = handle.stats();
        assert_eq!(stats.dropped, 10 - slow_seen.len() as u64);
        assert_eq!(stats.detached, 0);
    }

    #[tokio::test]
    async fn detach_closes_lagging_output() {
        let (tx, rx) = unbounded();
        let (fast, mut fast_reader) = unbounded();
        let (slow, slow_reader) = bounded(1);
        let handle = Split::new(bounded_queue(Overflow::Detach)).spawn(rx, [fast, slow]);

        for i in 0..10 {
            tx.send(i).await.unwrap();
            assert_eq!(timeout(WAIT, fast_reader.recv()).await.unwrap(), Some(i));
        }
        until_received(&handle, 10).await;
        assert_eq!(handle.stats().detached, 1);

        // The detached output closes after its queue is delivered, while the
        // input is still open.
        let slow_seen: Vec<u32> = timeout(WAIT, slow_reader.collect()).await.unwrap();
        assert!((1..=3).contains(&slow_seen.len()), "slow saw {slow_seen:?}");
        assert_eq!(slow_seen, (0..slow_seen.len() as u32).collect::<Vec<_>>());

        tx.close();
        assert_eq!(timeout(WAIT, fast_reader.recv()).await.unwrap(), None);
        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Completed);
        assert_eq!(handle.stats().dropped, 0);
    }

    #[tokio::test]
    async fn cancellation_closes_all_outputs() {
        let parent = CancellationToken::new();
        let (_tx, rx) = unbounded::<u8>();
        let (out_a, mut read_a) = unbounded();
        let (out_b, mut read_b) = unbounded();
        let handle = Split::default()
            .with_cancellation(parent.clone())
            .spawn(rx, [out_a, out_b]);

        parent.cancel();
        assert_eq!(timeout(WAIT, read_a.recv()).await.unwrap(), None);
        assert_eq!(timeout(WAIT, read_b.recv()).await.unwrap(), None);
        assert_eq!(handle.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert_eq!(handle.outcome(), Some(SessionOutcome::Cancelled));
    }
}
