//! A registry of independently-owned FIFO queues that a single consumer
//! drains as one stream of `(queue, item)` pairs.
//!
//! The set is one long-lived [`Stream`] so waker registration survives
//! across polls. Items on the same queue keep their FIFO order; no
//! ordering is guaranteed between different queues, and starvation of a
//! busy set is explicitly permitted.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;

/// Identity of one queue registered in a [`QueueSet`]. Ids are never
/// reused within a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

/// Producer handle for one queue. Cheap to clone and safe to use from any
/// task; items sent after the queue was removed are discarded.
#[derive(Debug)]
pub struct QueueSender<T> {
    id: QueueId,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Enqueues an item and wakes the consumer. Returns false if the queue
    /// is no longer registered.
    pub fn send(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecvTimeout {
    #[error("no queue became ready in time")]
    TimedOut,
    #[error("no queues are registered")]
    Closed,
}

/// The consumer side: owns every registered queue's receiving end.
#[derive(Debug)]
pub struct QueueSet<T> {
    queues: HashMap<QueueId, mpsc::UnboundedReceiver<T>>,
    next_id: u64,
}

impl<T> QueueSet<T> {
    pub fn new() -> Self {
        QueueSet {
            queues: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers a fresh queue and returns its producer handle.
    pub fn register(&mut self) -> QueueSender<T> {
        let id = QueueId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(id, rx);
        QueueSender { id, tx }
    }

    /// Deregisters a queue. Items still buffered on it — including ones
    /// with a pending wake — are dropped and never delivered.
    pub fn remove(&mut self, id: QueueId) -> bool {
        self.queues.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Waits for the next item on any registered queue, failing if nothing
    /// arrives within `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<(QueueId, T), RecvTimeout> {
        use futures::StreamExt;
        match tokio::time::timeout(wait, self.next()).await {
            Ok(Some(pair)) => Ok(pair),
            Ok(None) => Err(RecvTimeout::Closed),
            Err(_) => Err(RecvTimeout::TimedOut),
        }
    }
}

impl<T> Default for QueueSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stream for QueueSet<T> {
    type Item = (QueueId, T);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut ready = None;
        let mut dead = Vec::new();
        for (id, rx) in this.queues.iter_mut() {
            match rx.poll_recv(cx) {
                Poll::Ready(Some(item)) => {
                    ready = Some((*id, item));
                    break;
                }
                // every sender dropped and the buffer is drained
                Poll::Ready(None) => dead.push(*id),
                Poll::Pending => {}
            }
        }
        for id in dead {
            this.queues.remove(&id);
        }
        match ready {
            Some(pair) => Poll::Ready(Some(pair)),
            None if this.queues.is_empty() => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn preserves_fifo_order_within_a_queue() {
        let mut set = QueueSet::new();
        let q = set.register();
        for n in 0..5 {
            q.send(n);
        }
        for expected in 0..5 {
            let (id, item) = set.next().await.unwrap();
            assert_eq!(id, q.id());
            assert_eq!(item, expected);
        }
    }

    #[tokio::test]
    async fn times_out_when_nothing_arrives() {
        let mut set: QueueSet<u32> = QueueSet::new();
        let _q = set.register();
        let result = set.recv_timeout(Duration::from_millis(20)).await;
        assert_eq!(result, Err(RecvTimeout::TimedOut));
    }

    #[tokio::test]
    async fn delivers_from_multiple_queues() {
        let mut set = QueueSet::new();
        let a = set.register();
        let b = set.register();
        a.send("a1");
        b.send("b1");
        a.send("a2");

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(set.next().await.unwrap());
        }
        let from_a: Vec<_> = got.iter().filter(|(id, _)| *id == a.id()).collect();
        let from_b: Vec<_> = got.iter().filter(|(id, _)| *id == b.id()).collect();
        assert_eq!(from_a, [&(a.id(), "a1"), &(a.id(), "a2")]);
        assert_eq!(from_b, [&(b.id(), "b1")]);
    }

    #[tokio::test]
    async fn removed_queues_never_deliver() {
        let mut set = QueueSet::new();
        let a = set.register();
        let b = set.register();
        a.send(1);
        assert!(set.remove(a.id()));

        b.send(2);
        assert_eq!(set.next().await, Some((b.id(), 2)));
        assert_eq!(
            set.recv_timeout(Duration::from_millis(20)).await,
            Err(RecvTimeout::TimedOut)
        );
        assert!(!a.send(3));
    }

    #[tokio::test]
    async fn wakes_a_parked_consumer() {
        let mut set = QueueSet::new();
        let q = set.register();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            q.send(42);
        });
        let (_, item) = set.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(item, 42);
    }
}
