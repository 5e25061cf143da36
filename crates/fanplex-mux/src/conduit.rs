//! Typed, unidirectional, closeable conduits.
//!
//! A conduit has exactly one [`Sender`] and one [`Receiver`]. The sender is
//! not `Clone`: closing is a single, irreversible transition made by calling
//! [`Sender::close`] or dropping the sender, so a second close or a write after
//! close cannot be expressed. Readers observe closure as `None` from
//! [`Receiver::recv`], after every value sent before the close.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Create an unbounded conduit. Sends never wait.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Sender {
            inner: TxFlavor::Unbounded(tx),
        },
        Receiver {
            inner: RxFlavor::Unbounded(rx),
        },
    )
}

/// Create a conduit holding at most `capacity` unread values.
///
/// A capacity of zero is raised to one.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Sender {
            inner: TxFlavor::Bounded(tx),
        },
        Receiver {
            inner: RxFlavor::Bounded(rx),
        },
    )
}

enum TxFlavor<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum RxFlavor<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Writing half of a conduit.
pub struct Sender<T> {
    inner: TxFlavor<T>,
}

impl<T> Sender<T> {
    /// Send a value, waiting for room on a bounded conduit.
    ///
    /// Fails with the value handed back if the receiver is gone.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        match &self.inner {
            TxFlavor::Bounded(tx) => tx
                .send(value)
                .await
                .map_err(|e| SendError::Disconnected(e.0)),
            TxFlavor::Unbounded(tx) => tx.send(value).map_err(|e| SendError::Disconnected(e.0)),
        }
    }

    /// Send without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        match &self.inner {
            TxFlavor::Bounded(tx) => tx.try_send(value).map_err(|e| match e {
                mpsc::error::TrySendError::Full(v) => TrySendError::Full(v),
                mpsc::error::TrySendError::Closed(v) => TrySendError::Disconnected(v),
            }),
            TxFlavor::Unbounded(tx) => tx
                .send(value)
                .map_err(|e| TrySendError::Disconnected(e.0)),
        }
    }

    /// Close the conduit. Values already sent are still delivered.
    pub fn close(self) {
        drop(self);
    }

    /// Whether the receiving half has been dropped.
    pub fn is_disconnected(&self) -> bool {
        match &self.inner {
            TxFlavor::Bounded(tx) => tx.is_closed(),
            TxFlavor::Unbounded(tx) => tx.is_closed(),
        }
    }

    /// Resolve once the receiving half has been dropped.
    pub async fn disconnected(&self) {
        match &self.inner {
            TxFlavor::Bounded(tx) => tx.closed().await,
            TxFlavor::Unbounded(tx) => tx.closed().await,
        }
    }

    /// Second handle onto the same conduit, for sessions whose workers
    /// jointly own an output. The conduit closes when the last handle drops.
    pub(crate) fn share(&self) -> Self {
        let inner = match &self.inner {
            TxFlavor::Bounded(tx) => TxFlavor::Bounded(tx.clone()),
            TxFlavor::Unbounded(tx) => TxFlavor::Unbounded(tx.clone()),
        };
        Self { inner }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("bounded", &matches!(self.inner, TxFlavor::Bounded(_)))
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Reading half of a conduit.
pub struct Receiver<T> {
    inner: RxFlavor<T>,
}

impl<T> Receiver<T> {
    /// Next value, or `None` once the conduit is closed and empty.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.inner {
            RxFlavor::Bounded(rx) => rx.recv().await,
            RxFlavor::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Next value if one is ready.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let result = match &mut self.inner {
            RxFlavor::Bounded(rx) => rx.try_recv(),
            RxFlavor::Unbounded(rx) => rx.try_recv(),
        };
        result.map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => TryRecvError::Empty,
            mpsc::error::TryRecvError::Disconnected => TryRecvError::Closed,
        })
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match &mut self.inner {
            RxFlavor::Bounded(rx) => rx.poll_recv(cx),
            RxFlavor::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

impl<T> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().poll_recv(cx)
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("bounded", &matches!(self.inner, RxFlavor::Bounded(_)))
            .finish_non_exhaustive()
    }
}

/// A send on a conduit whose receiver is gone.
#[derive(PartialEq, Eq, thiserror::Error)]
pub enum SendError<T> {
    #[error("conduit receiver has been dropped")]
    Disconnected(T),
}

impl<T> SendError<T> {
    /// The value that could not be delivered.
    pub fn into_inner(self) -> T {
        match self {
            Self::Disconnected(value) => value,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disconnected(..)")
    }
}

/// A non-waiting send that could not complete.
#[derive(PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    #[error("conduit is full")]
    Full(T),
    #[error("conduit receiver has been dropped")]
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Disconnected(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

/// A non-waiting receive that produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    #[error("conduit is empty")]
    Empty,
    #[error("conduit is closed")]
    Closed,
}
