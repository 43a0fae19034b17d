// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policies for asynchronous verb calls.

use std::time::Duration;

/// Retry policy attached to an async call at enqueue time.
///
/// `count` attempts remain after the first; each failure doubles the backoff
/// up to `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetryParams {
    pub count: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            count: 0,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_retries() {
        let params = RetryParams::default();
        assert_eq!(params.count, 0);
        assert!(params.min_backoff <= params.max_backoff);
    }
}
