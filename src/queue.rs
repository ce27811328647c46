//! Bounded FIFO message queue with a single consumer task
//!
//! Producers never block: once the queue holds `capacity` messages, new
//! messages are dropped and a warning is logged for each one. The consumer
//! task parks on a [`Notify`] while the queue is empty.

use crate::protocol::Message;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of messages buffered per direction
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Outcome of [`BoundedQueue::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// Queue was full (or closed); the new message was discarded
    Dropped,
}

pub struct BoundedQueue {
    id: String,
    capacity: usize,
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl BoundedQueue {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity(id: impl Into<String>) -> Self {
        Self::new(id, DEFAULT_QUEUE_CAPACITY)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // A panicking holder cannot leave the deque half-modified
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message without blocking
    pub fn add(&self, message: Message) -> Enqueue {
        if self.closed.load(Ordering::Acquire) {
            debug!(queue = %self.id, "Queue closed, discarding message");
            return Enqueue::Dropped;
        }

        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                drop(items);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %self.id,
                    capacity = self.capacity,
                    "Queue full, dropping message"
                );
                return Enqueue::Dropped;
            }
            items.push_back(message);
        }

        self.notify.notify_one();
        Enqueue::Accepted
    }

    /// Remove the oldest message, if any
    pub fn get(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total messages dropped on overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the consumer task. `sink` is awaited for each message in FIFO
    /// order; the task exits after [`stop`](Self::stop).
    pub fn start_consumer<F, Fut>(self: &Arc<Self>, sink: F) -> JoinHandle<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            debug!(queue = %queue.id, "Queue consumer started");
            loop {
                if queue.is_closed() {
                    break;
                }
                match queue.get() {
                    Some(message) => sink(message).await,
                    None => queue.notify.notified().await,
                }
            }
            debug!(queue = %queue.id, "Queue consumer stopped");
        })
    }

    /// Close the queue, discard buffered messages and wake the consumer
    pub fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        let discarded = {
            let mut items = self.lock();
            let n = items.len();
            items.clear();
            n
        };
        if discarded > 0 {
            debug!(queue = %self.id, discarded, "Discarded queued messages on stop");
        }
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for BoundedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new("q", 10);
        for i in 0..3 {
            assert_eq!(queue.add(Message::new(format!("m{i}"))), Enqueue::Accepted);
        }
        assert_eq!(queue.get().unwrap().payload_str(), "m0");
        assert_eq!(queue.get().unwrap().payload_str(), "m1");
        assert_eq!(queue.get().unwrap().payload_str(), "m2");
        assert!(queue.get().is_none());
    }

    #[test]
    fn test_overflow_drops_newest() {
        let capacity = 5;
        let queue = BoundedQueue::new("q", capacity);
        for i in 0..capacity {
            assert_eq!(queue.add(Message::new(format!("m{i}"))), Enqueue::Accepted);
        }
        assert_eq!(queue.add(Message::new("overflow")), Enqueue::Dropped);
        assert_eq!(queue.len(), capacity);
        assert_eq!(queue.dropped(), 1);

        let mut drained = Vec::new();
        while let Some(message) = queue.get() {
            drained.push(message.payload_str());
        }
        assert_eq!(drained, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_default_capacity() {
        let queue = BoundedQueue::with_default_capacity("q");
        assert_eq!(queue.capacity(), DEFAULT_QUEUE_CAPACITY);
        for _ in 0..=DEFAULT_QUEUE_CAPACITY {
            queue.add(Message::new("x"));
        }
        assert_eq!(queue.len(), DEFAULT_QUEUE_CAPACITY);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_add_after_stop_is_dropped() {
        let queue = BoundedQueue::new("q", 2);
        queue.add(Message::new("a"));
        queue.stop();
        assert!(queue.is_empty());
        assert_eq!(queue.add(Message::new("b")), Enqueue::Dropped);
    }

    #[tokio::test]
    async fn test_consumer_receives_in_order() {
        let queue = Arc::new(BoundedQueue::new("q", 10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = queue.start_consumer(move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.payload_str());
            }
        });

        queue.add(Message::new("first"));
        queue.add(Message::new("second"));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("first"));
        assert_eq!(second.as_deref(), Some("second"));

        queue.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should exit after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_consumer_wakes_after_idle() {
        let queue = Arc::new(BoundedQueue::new("q", 10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = queue.start_consumer(move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.add(Message::new("late"));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload_str(), "late");
        queue.stop();
    }
}
