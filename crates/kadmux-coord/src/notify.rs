//! Notification targets.
//!
//! A [`Notify`] implementation receives events without blocking the caller.
//! A [`NotifyCloser`] can additionally be closed, after which it receives
//! nothing more. Unbounded tokio channels implement both.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::events::{BehaviourEvent, WaiterEvent};

/// A target that accepts events without blocking.
pub trait Notify<E>: Send + Sync {
    /// Deliver `ev`. Must not block.
    fn notify(&self, ev: E);
}

/// A notification target that is released once no more events will follow.
pub trait NotifyCloser<E>: Notify<E> {
    /// Release the target.
    fn close(self: Box<Self>);
}

impl<E: Send> Notify<E> for mpsc::UnboundedSender<E> {
    fn notify(&self, ev: E) {
        if self.send(ev).is_err() {
            trace!("Notification receiver dropped");
        }
    }
}

impl<E: Send> NotifyCloser<E> for mpsc::UnboundedSender<E> {
    fn close(self: Box<Self>) {
        // Dropping the last sender ends the receiver's stream.
    }
}

type Target = Box<dyn NotifyCloser<WaiterEvent>>;

/// Registered recipient of one query's progress and terminal events.
///
/// The behaviour keeps shared references to the same target, so events can
/// be handed over after its lock is released. Once closed, a waiter ignores
/// further events.
pub struct Waiter(Arc<Mutex<Option<Target>>>);

impl Waiter {
    /// Wrap a notification target.
    pub fn new(target: impl NotifyCloser<WaiterEvent> + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(target)))))
    }

    /// Create a waiter backed by an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WaiterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Another reference to the same target.
    pub(crate) fn share(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    pub(crate) fn notify(&self, ev: WaiterEvent) {
        match self.slot().as_ref() {
            Some(target) => target.notify(ev),
            None => trace!(query_id = %ev.query_id(), "Waiter already closed"),
        }
    }

    pub(crate) fn close(self) {
        let target = self.slot().take();
        if let Some(target) = target {
            target.close();
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Target>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Waiter")
    }
}

/// Handle through which the transport reports the outcome of a request.
#[derive(Clone)]
pub struct NotifyHandle(Arc<dyn Notify<BehaviourEvent>>);

impl NotifyHandle {
    /// Wrap a notification target.
    pub fn new(target: impl Notify<BehaviourEvent> + 'static) -> Self {
        Self(Arc::new(target))
    }

    /// Deliver `ev` to the target.
    pub fn notify(&self, ev: BehaviourEvent) {
        self.0.notify(ev);
    }
}

impl fmt::Debug for NotifyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NotifyHandle")
    }
}
