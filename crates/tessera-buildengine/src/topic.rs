// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process pub/sub topic.
//!
//! Each subscriber gets a bounded channel (128 deep). Publishing awaits
//! every subscriber's channel, so a slow subscriber applies backpressure to
//! the publisher rather than losing events; subscribers observe events in
//! publication order. Closed subscribers are pruned on the next publish.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

const SUBSCRIBER_BUFFER: usize = 128;

/// A broadcast topic with blocking backpressure.
pub struct Topic<T> {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<T>>>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe with a buffered receiver. Dropping the receiver
    /// unsubscribes on the next publish.
    pub async fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Publish to all subscribers, awaiting each.
    pub async fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock().await;
        let mut open = Vec::with_capacity(subscribers.len());
        for tx in subscribers.drain(..) {
            if tx.send(event.clone()).await.is_ok() {
                open.push(tx);
            }
        }
        *subscribers = open;
    }

    /// Number of live subscribers (for tests and diagnostics).
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers_in_order() {
        let topic = Topic::new();
        let mut a = topic.subscribe().await;
        let mut b = topic.subscribe().await;

        topic.publish(1u32).await;
        topic.publish(2u32).await;

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let topic = Topic::new();
        let rx = topic.subscribe().await;
        drop(rx);
        topic.publish(1u32).await;
        assert_eq!(topic.subscriber_count().await, 0);
    }
}
