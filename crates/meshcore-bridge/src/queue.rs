//! Bounded publish queue between the pipeline and the broker manager
//!
//! Pushing never blocks. Capacity bounds queued packets; at most one status
//! is held on top of that. A newer status replaces the pending one in place
//! and a packet pushed into a full queue evicts the oldest queued packet.

use crate::mapper::{MessageClass, PublishAttempt};
use crate::status::{bump, BridgeCounters};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Result of [`PublishQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended
    Queued,
    /// Appended after evicting the oldest packet
    DroppedOldest,
    /// Replaced a pending status
    Coalesced,
    /// Queue closed, attempt discarded
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<PublishAttempt>,
    packets: usize,
    closed: bool,
}

/// Bounded FIFO of publish attempts
#[derive(Debug)]
pub struct PublishQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    counters: Arc<BridgeCounters>,
}

impl PublishQueue {
    /// Create a queue holding at most `capacity` packets
    pub fn new(capacity: usize, counters: Arc<BridgeCounters>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            counters,
        }
    }

    /// Enqueue an attempt
    pub fn push(&self, attempt: PublishAttempt) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            match attempt.class {
                MessageClass::Status => {
                    let pending = inner
                        .items
                        .iter_mut()
                        .find(|a| a.class == MessageClass::Status);
                    match pending {
                        Some(slot) => {
                            *slot = attempt;
                            PushOutcome::Coalesced
                        }
                        None => {
                            inner.items.push_back(attempt);
                            PushOutcome::Queued
                        }
                    }
                }
                MessageClass::Packet => {
                    let mut outcome = PushOutcome::Queued;
                    if inner.packets >= self.capacity {
                        if let Some(idx) = inner
                            .items
                            .iter()
                            .position(|a| a.class == MessageClass::Packet)
                        {
                            inner.items.remove(idx);
                            inner.packets -= 1;
                            outcome = PushOutcome::DroppedOldest;
                        }
                    }
                    inner.items.push_back(attempt);
                    inner.packets += 1;
                    outcome
                }
            }
        };

        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => {
                bump(&self.counters.packets_dropped);
                warn!(
                    dropped = self.counters.packets_dropped.load(Ordering::Relaxed),
                    "Publish queue full, dropped oldest packet"
                );
            }
            PushOutcome::Coalesced => {
                bump(&self.counters.statuses_coalesced);
                debug!("Replaced pending status");
            }
            PushOutcome::Closed => {}
        }
        self.notify.notify_one();
        outcome
    }

    /// Put an attempt back at the head after a failed delivery
    ///
    /// Never evicts; the queue may briefly exceed capacity by one.
    pub fn requeue_front(&self, attempt: PublishAttempt) {
        let mut inner = self.inner.lock();
        if attempt.class == MessageClass::Status
            && inner.items.iter().any(|a| a.class == MessageClass::Status)
        {
            // a newer status is already waiting
            return;
        }
        if attempt.class == MessageClass::Packet {
            inner.packets += 1;
        }
        inner.items.push_front(attempt);
        drop(inner);
        self.notify.notify_one();
    }

    /// Take the head without waiting
    pub fn try_pop(&self) -> Option<PublishAttempt> {
        let mut inner = self.inner.lock();
        let attempt = inner.items.pop_front()?;
        if attempt.class == MessageClass::Packet {
            inner.packets -= 1;
        }
        Some(attempt)
    }

    /// Wait for the next attempt
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<PublishAttempt> {
        loop {
            let notified = self.notify.notified();
            if let Some(attempt) = self.try_pop() {
                return Some(attempt);
            }
            if self.inner.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Refuse further pushes; queued attempts remain available
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`PublishQueue::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued attempts
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Packet capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Qos;
    use bytes::Bytes;

    fn attempt(class: MessageClass, id: u8) -> PublishAttempt {
        PublishAttempt {
            topic: "t".into(),
            payload: Bytes::from(vec![id]),
            qos: Qos::AtMostOnce,
            retain: false,
            class,
        }
    }

    fn queue(capacity: usize) -> (PublishQueue, Arc<BridgeCounters>) {
        let counters = Arc::new(BridgeCounters::new());
        (PublishQueue::new(capacity, counters.clone()), counters)
    }

    #[test]
    fn test_fifo_order() {
        let (queue, _) = queue(4);
        for id in 0..3 {
            assert_eq!(queue.push(attempt(MessageClass::Packet, id)), PushOutcome::Queued);
        }
        let ids: Vec<u8> = std::iter::from_fn(|| queue.try_pop()).map(|a| a.payload[0]).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let (queue, counters) = queue(2);
        queue.push(attempt(MessageClass::Packet, 0));
        queue.push(attempt(MessageClass::Packet, 1));
        assert_eq!(
            queue.push(attempt(MessageClass::Packet, 2)),
            PushOutcome::DroppedOldest
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(counters.snapshot().packets_dropped, 1);
        assert_eq!(queue.try_pop().unwrap().payload[0], 1);
    }

    #[test]
    fn test_status_does_not_count_against_capacity() {
        let (queue, counters) = queue(1);
        queue.push(attempt(MessageClass::Packet, 0));
        assert_eq!(queue.push(attempt(MessageClass::Status, 1)), PushOutcome::Queued);
        assert_eq!(queue.len(), 2);
        assert_eq!(counters.snapshot().packets_dropped, 0);
    }

    #[test]
    fn test_status_coalesced_in_place() {
        let (queue, counters) = queue(4);
        queue.push(attempt(MessageClass::Status, 0));
        queue.push(attempt(MessageClass::Packet, 1));
        assert_eq!(
            queue.push(attempt(MessageClass::Status, 2)),
            PushOutcome::Coalesced
        );
        assert_eq!(counters.snapshot().statuses_coalesced, 1);
        assert_eq!(queue.try_pop().unwrap().payload[0], 2);
        assert_eq!(queue.try_pop().unwrap().payload[0], 1);
    }

    #[test]
    fn test_requeue_front() {
        let (queue, _) = queue(2);
        queue.push(attempt(MessageClass::Packet, 1));
        queue.push(attempt(MessageClass::Packet, 2));
        let head = queue.try_pop().unwrap();
        queue.push(attempt(MessageClass::Packet, 3));
        queue.requeue_front(head);
        let ids: Vec<u8> = std::iter::from_fn(|| queue.try_pop()).map(|a| a.payload[0]).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_stale_status_not_requeued() {
        let (queue, _) = queue(2);
        queue.push(attempt(MessageClass::Status, 1));
        let stale = queue.try_pop().unwrap();
        queue.push(attempt(MessageClass::Status, 2));
        queue.requeue_front(stale);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().unwrap().payload[0], 2);
    }

    #[test]
    fn test_drop_counter_matches_overflow() {
        let (queue, counters) = queue(5);
        for id in 0..20 {
            queue.push(attempt(MessageClass::Packet, id));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(counters.snapshot().packets_dropped, 15);
    }

    #[tokio::test]
    async fn test_recv_waits_and_close_drains() {
        let (queue, _) = queue(2);
        let queue = Arc::new(queue);

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(a) = queue.recv().await {
                    seen.push(a.payload[0]);
                }
                seen
            })
        };

        tokio::task::yield_now().await;
        queue.push(attempt(MessageClass::Packet, 7));
        queue.push(attempt(MessageClass::Packet, 8));
        queue.close();
        assert_eq!(queue.push(attempt(MessageClass::Packet, 9)), PushOutcome::Closed);

        assert_eq!(reader.await.unwrap(), vec![7, 8]);
    }
}
