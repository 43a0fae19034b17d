// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pub/sub delivery scheduling.
//!
//! Published topic events sit in the log until a subscription's cursor
//! advances past them. This background task periodically progresses idle
//! subscriptions, enqueueing one delivery call per advanced subscription;
//! the async-call executor then invokes the subscriber verb and its
//! completion hook returns the subscription to idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dal::Dal;
use crate::error::DalResult;

/// Background task draining topic events into delivery calls.
pub struct PubsubScheduler {
    dal: Dal,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl PubsubScheduler {
    pub fn new(dal: Dal, poll_interval: Duration) -> Self {
        Self {
            dal,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "pubsub scheduler started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("pubsub scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "subscription progression failed");
                    }
                }
            }
        }
    }

    /// One scan: advance every idle subscription with unread events by one
    /// event. Returns the number of deliveries enqueued.
    pub async fn scan(&self) -> DalResult<usize> {
        let dispatches = self.dal.progress_subscriptions().await?;
        for dispatch in &dispatches {
            debug!(
                subscription = %dispatch.subscription,
                verb = %dispatch.subscriber_verb,
                call = dispatch.async_call_id,
                "pubsub delivery scheduled"
            );
        }
        Ok(dispatches.len())
    }
}
