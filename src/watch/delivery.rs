//! Notification Delivery
//!
//! Every client with watches gets one bounded [`Outbox`]. The watch
//! dispatcher pushes into it without ever waiting; when the client does not
//! drain fast enough the oldest pending notification is dropped and the
//! outbox records the overflow. The transport consumes the outbox through a
//! [`NotificationStream`].

use crate::engine::Reply;
use crate::watch::Fingerprint;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A changed result for one watched query.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub fingerprint: Fingerprint,
    pub result: Reply,
    /// Per-subscription, strictly increasing. The initial result returned
    /// by a subscribe is sequence 0, so the first notification is 1.
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<Notification>,
    dropped: u64,
    overflowed: bool,
    closed: bool,
}

/// Bounded per-client notification queue.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    ready: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a notification, dropping the oldest one if the queue is
    /// full. Returns false if a notification was dropped or the outbox is
    /// closed.
    pub fn push(&self, notification: Notification) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }

        let mut kept_all = true;
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            state.dropped += 1;
            state.overflowed = true;
            kept_all = false;
        }
        state.queue.push_back(notification);
        drop(state);

        self.ready.notify_one();
        kept_all
    }

    /// Takes the next pending notification without waiting.
    pub fn try_pop(&self) -> Option<Notification> {
        self.state().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total notifications dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }

    /// Returns and clears the overflow indicator.
    pub fn take_overflow(&self) -> bool {
        std::mem::take(&mut self.state().overflowed)
    }

    /// Ends every stream over this outbox once it is drained.
    pub fn close(&self) {
        self.state().closed = true;
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// In-order stream of a client's notifications.
///
/// A client reconnecting under the same id gets a new stream over the same
/// outbox, so notifications queued while it was away are not lost.
#[derive(Debug, Clone)]
pub struct NotificationStream {
    outbox: Arc<Outbox>,
}

impl NotificationStream {
    pub(crate) fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }

    /// Waits for the next notification. Returns `None` once the client has
    /// been disconnected and everything queued before that was delivered.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            let ready = self.outbox.ready.notified();
            {
                let mut state = self.outbox.state();
                if let Some(notification) = state.queue.pop_front() {
                    return Some(notification);
                }
                if state.closed {
                    // wake any other stream over the same outbox
                    drop(state);
                    self.outbox.ready.notify_one();
                    return None;
                }
            }
            ready.await;
        }
    }

    pub fn try_next(&mut self) -> Option<Notification> {
        self.outbox.try_pop()
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }
}
