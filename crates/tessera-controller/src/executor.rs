// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The async-call executor.
//!
//! Acquires eligible calls from the queue under a lease, dispatches the verb
//! to an assigned runner, and completes the call. Origin-specific
//! bookkeeping (FSM transition promotion, subscription release) rides the
//! completion transaction so the queue and the dependent rows can never
//! disagree.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tessera_protocol::VerbClient;

use crate::clients::ClientCache;
use crate::dal::{AcquiredCall, AsyncOrigin, CallResult, Dal, no_hook};
use crate::dal::pubsub::reset_subscription;
use crate::dal::fsm::{fail_fsm_instance, finish_fsm_transition};
use crate::error::{DalError, DalResult};

/// Background worker draining the async-call queue.
pub struct AsyncCallExecutor {
    dal: Dal,
    clients: Arc<ClientCache>,
    poll_interval: Duration,
    lease_ttl: Duration,
    shutdown: Arc<Notify>,
}

impl AsyncCallExecutor {
    pub fn new(
        dal: Dal,
        clients: Arc<ClientCache>,
        poll_interval: Duration,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            dal,
            clients,
            poll_interval,
            lease_ttl,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "async-call executor started"
        );
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("async-call executor shutting down");
                    return;
                }

                result = self.process_next() => {
                    match result {
                        // Drained one call; immediately look for the next.
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = self.shutdown.notified() => return,
                                _ = tokio::time::sleep(self.poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "async call processing failed");
                            tokio::select! {
                                _ = self.shutdown.notified() => return,
                                _ = tokio::time::sleep(self.poll_interval) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Acquire and execute one call. Returns false when the queue is empty.
    async fn process_next(&self) -> DalResult<bool> {
        let acquired = match self.dal.acquire_async_call(self.lease_ttl).await {
            Ok(acquired) => acquired,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let call = &acquired.call;
        debug!(call = call.id, verb = %call.verb, origin = %call.origin, "executing async call");

        let result = match self.dispatch(&acquired).await {
            Ok(response) => CallResult::Success(response),
            Err(e) => CallResult::Failure(e),
        };
        self.complete(acquired, result).await?;
        Ok(true)
    }

    /// Route the verb to an assigned runner and invoke it.
    async fn dispatch(&self, acquired: &AcquiredCall) -> Result<serde_json::Value, String> {
        let call = &acquired.call;
        let endpoint = self
            .dal
            .get_route_for_module(&call.verb.module)
            .await
            .map_err(|e| format!("{}: route lookup failed: {e}", call.verb))?
            .ok_or_else(|| format!("{}: no assigned runner for module", call.verb))?;

        let client = self
            .clients
            .get(&endpoint)
            .await
            .map_err(|e| format!("{}: {e}", call.verb))?;
        let body = serde_json::to_vec(&call.request)
            .map_err(|e| format!("{}: unencodable request: {e}", call.verb))?;

        let response = VerbClient::new(client)
            .call(call.verb.to_string(), body)
            .await
            .map_err(|e| {
                // A dead runner should not poison the cache.
                let endpoint = endpoint.clone();
                let clients = self.clients.clone();
                tokio::spawn(async move { clients.evict(&endpoint).await });
                format!("{}: {e}", call.verb)
            })?;

        if response.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&response)
            .map_err(|e| format!("{}: undecodable response: {e}", call.verb))
    }

    /// Complete the call with origin-specific work in the same transaction.
    async fn complete(&self, acquired: AcquiredCall, result: CallResult) -> DalResult<()> {
        let call = acquired.call.clone();
        let origin = call.origin.clone();
        let terminal_failure =
            matches!(result, CallResult::Failure(_)) && call.remaining_attempts == 0;
        if let CallResult::Failure(ref error) = result {
            warn!(
                call = call.id,
                verb = %call.verb,
                remaining_attempts = call.remaining_attempts,
                error,
                "async call failed"
            );
        }

        let hook = match (&result, origin) {
            (CallResult::Success(_), AsyncOrigin::Fsm { fsm, key }) => {
                hook_fn(move |conn| {
                    Box::pin(async move { finish_fsm_transition(&mut *conn, &fsm, &key).await })
                })
            }
            (CallResult::Failure(_), AsyncOrigin::Fsm { fsm, key }) if terminal_failure => {
                hook_fn(move |conn| {
                    Box::pin(async move { fail_fsm_instance(&mut *conn, &fsm, &key).await })
                })
            }
            (_, AsyncOrigin::PubSub { subscription })
                if !matches!(result, CallResult::Failure(_)) || terminal_failure =>
            {
                hook_fn(move |conn| {
                    Box::pin(async move { reset_subscription(&mut *conn, &subscription).await })
                })
            }
            // Retried failures and cron completions need no extra work: cron
            // re-enqueueing is owned by the scheduler's scan.
            _ => no_hook(),
        };

        match self.dal.complete_async_call(acquired, result, hook).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                // Reclaimed by another controller after our lease lapsed.
                warn!(call = call.id, "async call was reclaimed before completion");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn hook_fn<F>(f: F) -> crate::dal::TxHook<'static>
where
    F: for<'c> FnOnce(
            &'c mut sqlx::PgConnection,
        )
            -> std::pin::Pin<Box<dyn Future<Output = Result<(), DalError>> + Send + 'c>>
        + Send
        + 'static,
{
    Box::new(f)
}
