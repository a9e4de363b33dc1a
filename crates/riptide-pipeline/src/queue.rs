//! Multi-consumer FIFO queue, consumed through pipeline sequencing.
//!
//! `add` delivers to the longest-waiting consumer when one is parked and
//! backlogs otherwise, so values are handed out round-robin across waiting
//! consumers and never duplicated. `clear` drops the backlog and wakes every
//! waiting consumer with an end-of-stream signal; streams obtained before a
//! `clear` end on their next poll, while `iterate` called afterwards starts
//! a fresh, unbounded iteration.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::oneshot;

use crate::step::lock;

enum Delivery<T> {
    Item(T),
    Closed,
}

struct Shared<T> {
    backlog: VecDeque<T>,
    /// Parked consumers, oldest first. Non-empty only while the backlog is
    /// empty: a consumer parks under the same lock that saw no backlog.
    waiters: VecDeque<oneshot::Sender<Delivery<T>>>,
    /// Bumped by `clear`; streams carry the epoch they were created under.
    epoch: u64,
}

/// Shared handle to the queue. Cloning is cheap and every clone feeds the
/// same backlog and consumers.
pub struct Queue<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                backlog: VecDeque::new(),
                waiters: VecDeque::new(),
                epoch: 0,
            })),
        }
    }

    /// Appends a value, handing it directly to the longest-waiting consumer
    /// if one is parked.
    pub fn add(&self, value: T) {
        let mut shared = lock(&self.shared);
        let mut value = value;
        while let Some(waiter) = shared.waiters.pop_front() {
            match waiter.send(Delivery::Item(value)) {
                Ok(()) => return,
                // Consumer went away while parked; try the next one.
                Err(Delivery::Item(returned)) => value = returned,
                Err(Delivery::Closed) => unreachable!("queue only sends items here"),
            }
        }
        shared.backlog.push_back(value);
        tracing::trace!(backlog = shared.backlog.len(), "value queued without a consumer");
    }

    /// Drops the backlog and ends every current iteration, waking parked
    /// consumers with the end-of-stream signal.
    pub fn clear(&self) {
        let mut shared = lock(&self.shared);
        tracing::debug!(
            dropped = shared.backlog.len(),
            waiters = shared.waiters.len(),
            "clearing queue"
        );
        shared.backlog.clear();
        shared.epoch += 1;
        for waiter in shared.waiters.drain(..) {
            let _ = waiter.send(Delivery::Closed);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.shared).backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.shared).backlog.is_empty()
    }

    /// Starts consuming. The stream yields until `clear` is called or the
    /// stream is dropped; it never ends on an empty backlog, it parks.
    pub fn iterate(&self) -> QueueStream<T> {
        let epoch = lock(&self.shared).epoch;
        QueueStream { shared: Arc::clone(&self.shared), epoch, pending: None }
    }
}

/// One consumer's view of the queue. Obtained from [`Queue::iterate`],
/// usually fed to `Task::sequence_from_stream`.
pub struct QueueStream<T> {
    shared: Arc<Mutex<Shared<T>>>,
    epoch: u64,
    pending: Option<oneshot::Receiver<Delivery<T>>>,
}

impl<T> Stream for QueueStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            if let Some(receiver) = this.pending.as_mut() {
                match Pin::new(receiver).poll(cx) {
                    Poll::Ready(Ok(Delivery::Item(value))) => {
                        this.pending = None;
                        return Poll::Ready(Some(value));
                    }
                    Poll::Ready(Ok(Delivery::Closed)) | Poll::Ready(Err(_)) => {
                        this.pending = None;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let mut shared = lock(&this.shared);
            if shared.epoch != this.epoch {
                return Poll::Ready(None);
            }
            if let Some(value) = shared.backlog.pop_front() {
                return Poll::Ready(Some(value));
            }
            let (sender, receiver) = oneshot::channel();
            shared.waiters.push_back(sender);
            drop(shared);
            // Loop back to poll the fresh receiver so the waker is
            // registered before returning.
            this.pending = Some(receiver);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
