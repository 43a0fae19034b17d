// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduling over the async-call queue.
//!
//! Verbs carrying a schedule get a pending async call at their next run
//! time. The scheduler is idempotent: each scan enqueues a call only for
//! cron verbs with no pending or executing call, so completions (and
//! restarts) naturally produce the next occurrence.
//!
//! Schedule syntax is deliberately thin: `every <n>s|m|h`. Richer schedule
//! languages belong to the module toolchains that emit them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use tessera_schema::{Decl, Ref, RetryParams};

use crate::dal::{AsyncOrigin, Dal};
use crate::error::DalResult;

/// Parse an `every <n>s|m|h` schedule.
pub fn parse_schedule(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix("every ")?.trim();
    let (value, unit) = rest.split_at(rest.len().checked_sub(1)?);
    let value: u64 = value.parse().ok()?;
    if value == 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Background task keeping one upcoming async call per cron verb.
pub struct CronScheduler {
    dal: Dal,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl CronScheduler {
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
            "cron scheduler started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("cron scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.scan(chrono::Utc::now()).await {
                        error!(error = %e, "cron scan failed");
                    }
                }
            }
        }
    }

    /// One scan: enqueue the next occurrence for every cron verb of an
    /// active deployment that has no outstanding call.
    pub async fn scan(&self, now: chrono::DateTime<chrono::Utc>) -> DalResult<u32> {
        let mut enqueued = 0;
        for deployment in self.dal.get_deployments(true).await? {
            for decl in &deployment.schema.decls {
                let Decl::Verb(verb) = decl else { continue };
                let Some(schedule) = verb.cron.as_deref() else {
                    continue;
                };
                let Some(interval) = parse_schedule(schedule) else {
                    debug!(module = %deployment.module_name, verb = %verb.name, schedule, "unparseable cron schedule");
                    continue;
                };
                let verb_ref = Ref::new(deployment.module_name.clone(), verb.name.clone());
                let origin = AsyncOrigin::Cron {
                    verb: verb_ref.clone(),
                };
                if self.has_outstanding_call(&origin).await? {
                    continue;
                }
                self.dal
                    .create_async_call(
                        &verb_ref,
                        &origin,
                        serde_json::json!({}),
                        now + chrono::Duration::from_std(interval).unwrap_or_default(),
                        RetryParams::default(),
                    )
                    .await?;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    async fn has_outstanding_call(&self, origin: &AsyncOrigin) -> DalResult<bool> {
        use crate::error::SqlxResultExt;
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM async_calls
            WHERE origin = $1 AND state IN ('pending', 'executing')
            "#,
        )
        .bind(origin.to_string())
        .fetch_one(self.dal.pool())
        .await
        .trans()?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parsing() {
        assert_eq!(parse_schedule("every 10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_schedule("every 5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_schedule("every 2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_schedule("every 0s"), None);
        assert_eq!(parse_schedule("every 10x"), None);
        assert_eq!(parse_schedule("10s"), None);
        assert_eq!(parse_schedule("every "), None);
    }
}
