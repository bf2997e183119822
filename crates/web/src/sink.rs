//! Per-subscriber output buffer
//!
//! A [`Sink`] is the publisher's handle, a [`SinkReceiver`] the subscriber's.
//! Pushing never blocks: when the buffer is full the oldest queued message is
//! dropped to make room.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use runcast_common::StreamMessage;

/// Result of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Queued after evicting the oldest message
    Overflowed,
    Closed,
}

struct Shared {
    id: u64,
    capacity: usize,
    queue: Mutex<VecDeque<StreamMessage>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Shared {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }
}

/// Publisher side of a subscription
#[derive(Clone)]
pub struct Sink {
    shared: Arc<Shared>,
}

/// Subscriber side of a subscription; dropping it closes the sink
pub struct SinkReceiver {
    shared: Arc<Shared>,
}

impl Sink {
    pub fn channel(id: u64, capacity: usize) -> (Sink, SinkReceiver) {
        let shared = Arc::new(Shared {
            id,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (
            Sink {
                shared: shared.clone(),
            },
            SinkReceiver { shared },
        )
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn push(&self, message: StreamMessage) -> Pushed {
        let outcome = {
            let mut queue = self.shared.queue.lock();
            if self.shared.closed.load(Ordering::Acquire) {
                return Pushed::Closed;
            }
            let outcome = if queue.len() >= self.shared.capacity {
                queue.pop_front();
                Pushed::Overflowed
            } else {
                Pushed::Queued
            };
            queue.push_back(message);
            outcome
        };
        self.shared.notify.notify_one();
        outcome
    }

    /// Idempotent. Already queued messages can still be received.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl SinkReceiver {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Next message, or `None` once the sink is closed and drained.
    ///
    /// Cancel safe: a message is only taken out of the queue when it is returned.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.shared.queue.lock().pop_front();
            if let Some(message) = next {
                return Some(message);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        self.shared.queue.lock().pop_front()
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for SinkReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
