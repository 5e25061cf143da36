//! Soak runs: real producer and consumer tasks around one session.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use fanplex_core::{Error, MergeConfig, Result, SplitConfig};
use fanplex_mux::{
    Merge, MergeSession, MergeStats, Receiver, SessionOutcome, Split, SplitStats, bounded,
    spawn_drain,
};

/// Capacity of the conduits the synthetic producers and readers use.
const CONDUIT_CAPACITY: usize = 64;

/// N producers, each sending `items` sequential values, into one merge.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub inputs: usize,
    pub items: u64,
    /// Discard the merged output with a drain instead of reading it.
    pub discard: bool,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub expected: u64,
    pub received: u64,
    pub stats: MergeStats,
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
}

impl MergeReport {
    pub fn is_ok(&self) -> bool {
        self.received == self.expected && self.outcome == SessionOutcome::Completed
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merge: {}/{} values from {} inputs, outcome {}, {:?}",
            self.received, self.expected, self.stats.inputs, self.outcome, self.elapsed
        )
    }
}

/// One producer broadcast to `outputs` readers, `stalled` of which never read.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    pub outputs: usize,
    pub items: u64,
    pub stalled: usize,
}

#[derive(Debug, Clone)]
pub struct SplitReport {
    pub items: u64,
    /// Values seen by each reading output, in output order.
    pub per_output: Vec<u64>,
    /// Whether every reading output saw strictly increasing values.
    pub in_order: bool,
    pub stalled: usize,
    pub stats: SplitStats,
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
}

impl SplitReport {
    pub fn is_ok(&self) -> bool {
        let expected_outcome = if self.stalled > 0 {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Completed
        };
        self.in_order
            && self.per_output.iter().all(|&n| n == self.items)
            && self.outcome == expected_outcome
    }
}

impl fmt::Display for SplitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let complete = self.per_output.iter().filter(|&&n| n == self.items).count();
        write!(
            f,
            "split: {complete}/{} reading outputs complete ({} stalled), {} received, {} dropped, {} detached, outcome {}, {:?}",
            self.per_output.len(),
            self.stalled,
            self.stats.received,
            self.stats.dropped,
            self.stats.detached,
            self.outcome,
            self.elapsed
        )
    }
}

pub async fn run_merge(plan: &MergePlan, config: MergeConfig) -> Result<MergeReport> {
    let expected = u64::try_from(plan.inputs)
        .ok()
        .and_then(|inputs| inputs.checked_mul(plan.items))
        .ok_or_else(|| {
            Error::Config(format!(
                "{} inputs x {} items overflows the value count",
                plan.inputs, plan.items
            ))
        })?;
    let started = Instant::now();

    let mut inputs = Vec::with_capacity(plan.inputs);
    let mut producers = Vec::with_capacity(plan.inputs);
    for _ in 0..plan.inputs {
        let (tx, rx) = bounded(CONDUIT_CAPACITY);
        inputs.push(rx);
        let items = plan.items;
        producers.push(tokio::spawn(async move {
            for i in 0..items {
                if tx.send(i).await.is_err() {
                    break;
                }
            }
        }));
    }

    let MergeSession { output, handle } = Merge::new(config).with_name("soak-merge").spawn(inputs);

    let received = if plan.discard {
        spawn_drain(output).await.map_err(|e| Error::TaskFailed(e.to_string()))?
    } else {
        count(output).await
    };

    for producer in producers {
        producer.await.map_err(|e| Error::TaskFailed(e.to_string()))?;
    }
    let outcome = handle.wait().await?;

    let report = MergeReport {
        expected,
        received,
        stats: handle.stats(),
        outcome,
        elapsed: started.elapsed(),
    };
    info!(received = report.received, expected = report.expected, %outcome, "Merge soak finished");
    Ok(report)
}

async fn count<T>(mut output: Receiver<T>) -> u64 {
    let mut n = 0;
    while output.recv().await.is_some() {
        n += 1;
    }
    n
}

pub async fn run_split(plan: &SplitPlan, config: SplitConfig) -> Result<SplitReport> {
    let started = Instant::now();
    let stalled = plan.stalled.min(plan.outputs);

    let (tx, rx) = bounded(CONDUIT_CAPACITY);
    let mut outputs = Vec::with_capacity(plan.outputs);
    let mut readers = Vec::with_capacity(plan.outputs);
    let mut unread = Vec::with_capacity(stalled);
    for index in 0..plan.outputs {
        let (out_tx, out_rx) = bounded(CONDUIT_CAPACITY);
        outputs.push(out_tx);
        if index < plan.outputs - stalled {
            readers.push(tokio::spawn(read_in_order(out_rx)));
        } else {
            unread.push(out_rx);
        }
    }

    let handle = Split::new(config).with_name("soak-split").spawn(rx, outputs);

    for i in 0..plan.items {
        if tx.send(i).await.is_err() {
            break;
        }
    }
    tx.close();

    let mut per_output = Vec::with_capacity(readers.len());
    let mut in_order = true;
    for reader in readers {
        let (seen, ordered) = reader
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?;
        per_output.push(seen);
        in_order &= ordered;
    }

    // Stalled outputs never finish on their own.
    if !unread.is_empty() {
        debug!(stalled = unread.len(), "Cancelling split with stalled outputs");
        handle.cancel();
    }
    let outcome = handle.wait().await?;
    drop(unread);

    let report = SplitReport {
        items: plan.items,
        per_output,
        in_order,
        stalled,
        stats: handle.stats(),
        outcome,
        elapsed: started.elapsed(),
    };
    info!(received = report.stats.received, %outcome, "Split soak finished");
    Ok(report)
}

/// Count values and check they arrive strictly increasing.
async fn read_in_order(mut output: Receiver<u64>) -> (u64, bool) {
    let mut seen = 0;
    let mut last = None;
    let mut ordered = true;
    while let Some(v) = output.recv().await {
        ordered &= last.is_none_or(|prev| prev < v);
        last = Some(v);
        seen += 1;
    }
    (seen, ordered)
}
