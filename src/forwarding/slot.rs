//! Per-port socket ownership for the concrete engines.
//!
//! A forwarding task never owns its socket outright. The socket sits in a
//! [`SocketSlot`] that the engine can empty synchronously, which closes the
//! socket immediately. Aborting a tokio task alone only drops its future on
//! the task's next scheduling, so a port removed and re-added within the same
//! pass would otherwise still be bound.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

/// Shared socket that can be closed from outside the task using it.
pub(crate) struct SocketSlot<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for SocketSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SocketSlot<T> {
    pub(crate) fn new(socket: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(socket))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the socket. Pending and future [`poll`](Self::poll) calls resolve
    /// to `None`.
    pub(crate) fn close(&self) {
        self.lock().take();
    }

    /// Drive a poll-style socket operation. Resolves to `None` once the slot
    /// has been closed.
    pub(crate) async fn poll<R>(
        &self,
        mut op: impl FnMut(&T, &mut Context<'_>) -> Poll<R>,
    ) -> Option<R> {
        std::future::poll_fn(|cx| match self.lock().as_ref() {
            Some(socket) => op(socket, cx).map(Some),
            None => Poll::Ready(None),
        })
        .await
    }
}

/// A bound local port and the task servicing it.
pub(crate) struct PortForward<T> {
    slot: SocketSlot<T>,
    task: JoinHandle<()>,
}

impl<T> PortForward<T> {
    pub(crate) fn new(slot: SocketSlot<T>, task: JoinHandle<()>) -> Self {
        Self { slot, task }
    }

    /// Close the socket now and cancel the task.
    pub(crate) fn close(self) {
        self.slot.close();
        self.task.abort();
    }
}
