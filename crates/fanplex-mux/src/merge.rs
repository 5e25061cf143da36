//! Fan-in: merge a runtime-sized set of conduits into one.
//!
//! Each input gets its own forwarding task writing into the shared output.
//! A counter of still-open inputs starts at N; the forwarder that takes it to
//! zero holds the last handle on the output, so the output closes exactly
//! when every input has closed.
//!
//! When several inputs are ready at once, which one is forwarded first is up
//! to the scheduler. Values from one input keep their relative order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fanplex_core::{MergeConfig, Result};

use crate::conduit::{self, Receiver, Sender};
use crate::session::{self, Completion, SessionOutcome, WorkerExit};

/// Merge `inputs` into a new conduit with the default configuration.
///
/// The returned conduit closes once every input has closed; with no inputs it
/// is closed already.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn merge<T, I>(inputs: I) -> Receiver<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Receiver<T>>,
{
    Merge::new(MergeConfig::default()).spawn(inputs).output
}

/// Builder for a fan-in session.
#[derive(Debug, Clone)]
pub struct Merge {
    config: MergeConfig,
    name: Arc<str>,
    cancel: Option<CancellationToken>,
}

impl Merge {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            name: Arc::from("merge"),
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

    /// Start forwarding `inputs` and return the merged output.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<T, I>(self, inputs: I) -> MergeSession<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = Receiver<T>>,
    {
        let inputs: Vec<Receiver<T>> = inputs.into_iter().collect();
        let (output_tx, output_rx) = match self.config.output_capacity {
            Some(capacity) => conduit::bounded(capacity),
            None => conduit::unbounded(),
        };

        let counters = Arc::new(MergeCounters {
            inputs: inputs.len(),
            open_inputs: AtomicUsize::new(inputs.len()),
            forwarded: AtomicU64::new(0),
        });
        let cancel = session::session_token(self.cancel.as_ref());

        info!(
            session = %self.name,
            inputs = inputs.len(),
            output_capacity = ?self.config.output_capacity,
            "Merge session started"
        );

        let workers = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                tokio::spawn(forward(Forwarder {
                    session: Arc::clone(&self.name),
                    index,
                    input,
                    output: output_tx.share(),
                    counters: Arc::clone(&counters),
                    cancel: cancel.clone(),
                }))
            })
            .collect();

        // Forwarders now hold the only handles; with zero inputs this closes
        // the output right away.
        drop(output_tx);

        let completion = session::supervise("merge", Arc::clone(&self.name), workers, fold_outcome);

        MergeSession {
            output: output_rx,
            handle: MergeHandle {
                counters,
                cancel,
                completion,
            },
        }
    }
}

impl Default for Merge {
    fn default() -> Self {
        Self::new(MergeConfig::default())
    }
}

/// A running fan-in session.
#[derive(Debug)]
pub struct MergeSession<T> {
    /// The merged conduit.
    pub output: Receiver<T>,
    /// Control and completion handle.
    pub handle: MergeHandle,
}

impl<T> MergeSession<T> {
    pub fn into_parts(self) -> (Receiver<T>, MergeHandle) {
        (self.output, self.handle)
    }
}

/// Cloneable control handle for a fan-in session.
#[derive(Debug, Clone)]
pub struct MergeHandle {
    counters: Arc<MergeCounters>,
    cancel: CancellationToken,
    completion: Completion,
}

impl MergeHandle {
    pub fn stats(&self) -> MergeStats {
        MergeStats {
            inputs: self.counters.inputs,
            open_inputs: self.counters.open_inputs.load(Ordering::Acquire),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
        }
    }

    /// Stop forwarding and close the output. Values not yet forwarded are
    /// discarded, including one a forwarder holds while waiting on a full
    /// output, and the inputs are dropped.
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

/// Point-in-time counters of a fan-in session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Inputs the session started with.
    pub inputs: usize,
    /// Inputs whose forwarder is still running.
    pub open_inputs: usize,
    /// Values written to the output so far.
    pub forwarded: u64,
}

#[derive(Debug)]
struct MergeCounters {
    inputs: usize,
    open_inputs: AtomicUsize,
    forwarded: AtomicU64,
}

struct Forwarder<T> {
    session: Arc<str>,
    index: usize,
    input: Receiver<T>,
    output: Sender<T>,
    counters: Arc<MergeCounters>,
    cancel: CancellationToken,
}

async fn forward<T>(forwarder: Forwarder<T>) -> WorkerExit {
    let Forwarder {
        session,
        index,
        mut input,
        output,
        counters,
        cancel,
    } = forwarder;

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break WorkerExit::Cancelled,
            () = output.disconnected() => break WorkerExit::Detached,
            next = input.recv() => {
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
                counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    let remaining = counters.open_inputs.fetch_sub(1, Ordering::AcqRel) - 1;
    debug!(session = %session, input = index, ?exit, remaining, "Merge input finished");
    if remaining == 0 {
        debug!(session = %session, "Last merge input finished, closing output");
    }
    // `output` drops here; the last forwarder's drop closes the merged conduit.
    exit
}

fn fold_outcome(exits: &[WorkerExit]) -> SessionOutcome {
    if exits.contains(&WorkerExit::Cancelled) {
        SessionOutcome::Cancelled
    } else if exits.contains(&WorkerExit::Detached) {
        SessionOutcome::Detached
    } else {
        SessionOutcome::Completed
    }
}
