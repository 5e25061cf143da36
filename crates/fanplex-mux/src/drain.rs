//! Discard a conduit to completion.
//!
//! A merge or split output nobody reads keeps its forwarding tasks parked
//! forever once the conduit fills up. Draining it is the cheap way out when
//! the values are not needed.

use tokio::task::JoinHandle;
use tracing::trace;

use crate::conduit::Receiver;

/// Consume and discard every value until `input` closes.
///
/// Returns how many values were discarded.
pub async fn drain<T>(mut input: Receiver<T>) -> u64 {
    let mut discarded = 0u64;
    while input.recv().await.is_some() {
        discarded += 1;
    }
    trace!(discarded, "Conduit drained");
    discarded
}

/// Run [`drain`] as a background task.
pub fn spawn_drain<T>(input: Receiver<T>) -> JoinHandle<u64>
where
    T: Send + 'static,
{
    tokio::spawn(drain(input))
}
