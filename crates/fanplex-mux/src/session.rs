//! Session lifecycle shared by merge and split.
//!
//! Every session runs a set of worker tasks and one supervisor that joins
//! them and publishes the terminal [`SessionOutcome`] on a watch channel.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fanplex_core::{Error, Result};

/// Terminal state of a merge or split session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOutcome {
    /// Inputs exhausted; every output closed after full delivery.
    Completed,
    /// The session's cancellation token fired first.
    Cancelled,
    /// The merged output's reader went away before the inputs closed.
    Detached,
}

impl SessionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Detached => "detached",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single worker task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Its source closed and everything was passed on.
    Exhausted,
    Cancelled,
    /// Its destination's reader is gone.
    Detached,
}

#[derive(Debug, Clone)]
enum SessionState {
    Running,
    Finished(SessionOutcome),
    Failed(String),
}

/// Reduces worker exits to the session outcome.
pub(crate) type OutcomeFold = fn(&[WorkerExit]) -> SessionOutcome;

/// Cloneable view of a session's completion.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    state: watch::Receiver<SessionState>,
}

impl Completion {
    /// Wait for the terminal outcome.
    pub(crate) async fn wait(&self) -> Result<SessionOutcome> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, SessionState::Running))
            .await
            .map_err(|_| Error::TaskFailed("session supervisor exited without reporting".into()))?;
        match &*settled {
            SessionState::Finished(outcome) => Ok(*outcome),
            SessionState::Failed(reason) => Err(Error::TaskFailed(reason.clone())),
            SessionState::Running => Err(Error::TaskFailed("session still running".into())),
        }
    }

    /// Outcome if the session has already finished.
    pub(crate) fn outcome(&self) -> Option<SessionOutcome> {
        match &*self.state.borrow() {
            SessionState::Finished(outcome) => Some(*outcome),
            SessionState::Running | SessionState::Failed(_) => None,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        !matches!(&*self.state.borrow(), SessionState::Running)
    }
}

/// Resolve the token a session runs under: a child of the caller's token,
/// so cancelling one session never cancels its parent.
pub(crate) fn session_token(parent: Option<&CancellationToken>) -> CancellationToken {
    parent.map_or_else(CancellationToken::new, CancellationToken::child_token)
}

/// Spawn the supervisor that joins `workers` and publishes the outcome.
pub(crate) fn supervise(
    kind: &'static str,
    name: Arc<str>,
    workers: Vec<JoinHandle<WorkerExit>>,
    fold: OutcomeFold,
) -> Completion {
    let (tx, rx) = watch::channel(SessionState::Running);

    tokio::spawn(async move {
        let mut exits = Vec::with_capacity(workers.len());
        let mut failure = None;

        // Join every worker, even after a failure, so none is left behind.
        for worker in workers {
            match worker.await {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    warn!(session = %name, kind, error = %e, "Session worker failed");
                    if failure.is_none() {
                        failure = Some(e.to_string());
                    }
                }
            }
        }

        let state = match failure {
            Some(reason) => SessionState::Failed(reason),
            None => {
                let outcome = fold(&exits);
                info!(session = %name, kind, workers = exits.len(), %outcome, "Session finished");
                SessionState::Finished(outcome)
            }
        };
        tx.send_replace(state);
        debug!(session = %name, kind, "Session supervisor exiting");
    });

    Completion { state: rx }
}
