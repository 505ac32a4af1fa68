//! Outbound frame queue.
//!
//! Single-consumer FIFO with ack/nack advance: the consumer is asked to
//! take the head and answers whether it did. A `false` stops draining,
//! which is how backpressure during disconnects falls out for free —
//! the connected-state consumer sends and acks, the disconnected one
//! nacks and everything stays queued, in order, until the session comes
//! back.

use std::collections::VecDeque;

/// FIFO of outbound items with a caller-supplied consumer.
#[derive(Debug, Default)]
pub struct MessageQueue<T> {
    items: VecDeque<T>,
}

impl<T> MessageQueue<T> {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { items: VecDeque::new() }
    }

    /// Enqueue at the tail, then drain as far as `consumer` allows.
    pub fn push(&mut self, item: T, consumer: impl FnMut(&T) -> bool) {
        self.items.push_back(item);
        self.process(consumer);
    }

    /// Insert `items` at the head, preserving their given order, then
    /// drain as far as `consumer` allows.
    pub fn prepend(&mut self, items: Vec<T>, consumer: impl FnMut(&T) -> bool) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        self.process(consumer);
    }

    /// Offer the head to `consumer` repeatedly; `true` removes the head
    /// and continues, `false` stops.
    pub fn process(&mut self, mut consumer: impl FnMut(&T) -> bool) {
        while let Some(head) = self.items.front() {
            if consumer(head) {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop everything.
    pub fn empty(&mut self) {
        self.items.clear();
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn acking_consumer_drains_in_order() {
        let mut queue = MessageQueue::new();
        let mut sent = Vec::new();
        for n in 1..=3 {
            queue.push(n, |item| {
                sent.push(*item);
                true
            });
        }
        assert_eq!(sent, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn nacking_consumer_keeps_everything() {
        let mut queue = MessageQueue::new();
        for n in 1..=3 {
            queue.push(n, |_| false);
        }
        assert_eq!(queue.len(), 3);

        // Flip to acking: the backlog drains in order.
        let mut sent = Vec::new();
        queue.process(|item| {
            sent.push(*item);
            true
        });
        assert_eq!(sent, vec![1, 2, 3]);
    }

    #[test]
    fn consumer_can_stop_mid_drain() {
        let mut queue = MessageQueue::new();
        for n in 1..=4 {
            queue.push(n, |_| false);
        }
        let mut sent = Vec::new();
        queue.process(|item| {
            if *item <= 2 {
                sent.push(*item);
                true
            } else {
                false
            }
        });
        assert_eq!(sent, vec![1, 2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn prepend_preserves_given_order() {
        let mut queue = MessageQueue::new();
        queue.push("old", |_| false);
        queue.prepend(vec!["a", "b", "c"], |_| false);

        let mut order = Vec::new();
        queue.process(|item| {
            order.push(*item);
            true
        });
        assert_eq!(order, vec!["a", "b", "c", "old"]);
    }

    #[test]
    fn empty_drops_all() {
        let mut queue = MessageQueue::new();
        queue.push(1, |_| false);
        queue.push(2, |_| false);
        queue.empty();
        assert!(queue.is_empty());
    }

    proptest! {
        /// FIFO preservation: whatever mix of pushes and partial
        /// drains, items come out in the order they went in.
        #[test]
        fn fifo_order_is_preserved(
            items in prop::collection::vec(any::<u32>(), 0..64),
            ack_pattern in prop::collection::vec(any::<bool>(), 0..64),
        ) {
            let mut queue = MessageQueue::new();
            let mut sent = Vec::new();
            let mut acks = ack_pattern.into_iter();

            for item in &items {
                queue.push(*item, |head| {
                    if acks.next().unwrap_or(false) {
                        sent.push(*head);
                        true
                    } else {
                        false
                    }
                });
            }
            // Final full drain.
            queue.process(|head| {
                sent.push(*head);
                true
            });

            prop_assert_eq!(sent, items);
        }
    }
}
