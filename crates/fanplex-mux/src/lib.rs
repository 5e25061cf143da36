//! fanplex multiplexer library
//!
//! Dynamic fan-in and fan-out over typed, closeable async conduits:
//! - [`conduit`]: the unidirectional channel every operator works on
//! - [`drain`]: discard a conduit to completion
//! - [`merge`]: N conduits into one, closing once every input has closed
//! - [`split`]: one conduit broadcast to N, each output progressing independently
//!
//! All operators spawn Tokio tasks and must be called inside a Tokio runtime.

pub mod conduit;
pub mod drain;
pub mod merge;
pub mod session;
pub mod split;

pub use conduit::{Receiver, SendError, Sender, TryRecvError, TrySendError, bounded, unbounded};
pub use drain::{drain, spawn_drain};
pub use merge::{Merge, MergeHandle, MergeSession, MergeStats, merge};
pub use session::SessionOutcome;
pub use split::{Split, SplitHandle, SplitStats, split};

pub use fanplex_core::{MergeConfig, Overflow, QueuePolicy, SplitConfig};
