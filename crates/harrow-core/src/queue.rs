//! Bounded FIFO task queue shared by one producer and N workers.
//!
//! Built on a bounded `tokio::sync::mpsc` channel. The receiver sits behind
//! an async mutex so any number of workers can compete for items; whichever
//! worker is free takes the next one. Workers treat a dequeue timeout as
//! "drained" and exit, so there is no poison pill.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Result of one [`TaskQueue::dequeue`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The producer closed the queue and every item has been taken.
    Closed,
    /// Shutdown was requested.
    Cancelled,
}

struct Inner<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    closed: CancellationToken,
}

/// Cloneable handle to the queue.
pub struct TaskQueue<T> {
    inner: Arc<Inner<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Send> TaskQueue<T> {
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                closed: CancellationToken::new(),
            }),
            cancel,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait for space and push `item`.
    ///
    /// Returns [`AppError::QueueClosed`] if the queue is closed, before or
    /// while waiting, or shutdown was requested while waiting.
    pub async fn enqueue(&self, item: T) -> Result<(), AppError> {
        let Some(tx) = self.sender() else {
            return Err(AppError::QueueClosed);
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AppError::QueueClosed),
            () = self.inner.closed.cancelled() => Err(AppError::QueueClosed),
            sent = tx.send(item) => sent.map_err(|_| AppError::QueueClosed),
        }
    }

    /// Wait up to `timeout` for the next item.
    pub async fn dequeue(&self, timeout: Duration) -> Dequeued<T> {
        if self.cancel.is_cancelled() {
            return Dequeued::Cancelled;
        }
        let wait = async {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Dequeued::Cancelled,
            received = tokio::time::timeout(timeout, wait) => match received {
                Ok(Some(item)) => Dequeued::Item(item),
                Ok(None) => Dequeued::Closed,
                Err(_) => Dequeued::TimedOut,
            },
        }
    }

    /// Stop accepting items and fail any enqueue still waiting for space.
    /// Items already queued can still be dequeued.
    pub fn close(&self) {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}
