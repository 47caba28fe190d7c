//! Publish/subscribe seam between the command pipeline and its consumers.
//!
//! The bus only carries envelopes that are already committed to the event
//! store. Delivery is at-least-once; projections dedupe by stream sequence.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Receiving end handed out by [`EventBus::subscribe`]. Owned by one consumer
/// thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// ```text
/// dispatch → EventStore::append → EventBus::publish → workers
/// ```
///
/// A failed publish leaves the events committed; consumers catch up by
/// rebuilding from the store.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
