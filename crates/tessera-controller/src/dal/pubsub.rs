// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topics, subscriptions and subscribers.
//!
//! A subscription holds a cursor into its topic's event log. Progression is
//! one event at a time per subscription: an idle subscription with unread
//! events gets its cursor advanced, is marked executing and an async call is
//! enqueued to one of its subscribers. The call's completion hook returns
//! the subscription to idle.

use tracing::debug;

use tessera_schema::{Decl, Module, Ref, RetryParams};

use crate::error::{DalError, DalResult, SqlxResultExt};
use crate::keys::new_suffix;

use super::async_calls::{AsyncOrigin, create_async_call};
use super::Dal;

/// One pub/sub delivery enqueued by [`Dal::progress_subscriptions`].
#[derive(Debug, Clone)]
pub struct SubscriptionDispatch {
    pub subscription: Ref,
    pub subscriber_verb: Ref,
    pub async_call_id: i64,
    pub topic_event_id: i64,
}

#[derive(sqlx::FromRow)]
struct PendingSubscription {
    id: i64,
    module_name: String,
    name: String,
    topic_id: i64,
    cursor: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct NextEvent {
    id: i64,
    payload: Vec<u8>,
}

impl Dal {
    /// Register the topics and subscriptions a module schema declares.
    pub async fn create_pubsub_for_module(&self, module: &Module) -> DalResult<()> {
        let module_id: Option<i64> = sqlx::query_scalar("SELECT id FROM modules WHERE name = $1")
            .bind(&module.name)
            .fetch_optional(&self.pool)
            .await
            .trans()?;
        let module_id =
            module_id.ok_or_else(|| DalError::NotFound(format!("module {}", module.name)))?;

        for decl in &module.decls {
            match decl {
                Decl::Topic(topic) => {
                    sqlx::query(
                        r#"
                        INSERT INTO topics (key, module_id, name, event_type)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (module_id, name) DO UPDATE SET event_type = $4
                        "#,
                    )
                    .bind(format!("top-{}", new_suffix()))
                    .bind(module_id)
                    .bind(&topic.name)
                    .bind(topic.event.to_string())
                    .execute(&self.pool)
                    .await
                    .trans()?;
                }
                Decl::Subscription(sub) => {
                    sqlx::query(
                        r#"
                        INSERT INTO topic_subscriptions (key, topic_id, module_id, name)
                        SELECT $1, t.id, $2, $3
                        FROM topics t
                        JOIN modules m ON m.id = t.module_id
                        WHERE m.name = $4 AND t.name = $5
                        ON CONFLICT (module_id, name) DO NOTHING
                        "#,
                    )
                    .bind(format!("sub-{}", new_suffix()))
                    .bind(module_id)
                    .bind(&sub.name)
                    .bind(&sub.topic.module)
                    .bind(&sub.topic.name)
                    .execute(&self.pool)
                    .await
                    .trans()?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Register a deployment's verbs as delivery targets for the module's
    /// subscriptions (convention: verb name = subscription name).
    pub async fn create_subscribers_for_deployment(
        &self,
        deployment_key: &str,
        module: &Module,
    ) -> DalResult<()> {
        for decl in &module.decls {
            let Decl::Subscription(sub) = decl else {
                continue;
            };
            let Some(verb) = module.verb(&sub.name) else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO topic_subscribers (key, topic_subscriptions_id, deployment_id, verb)
                SELECT $1, s.id, d.id, $2
                FROM topic_subscriptions s
                JOIN modules m ON m.id = s.module_id
                JOIN deployments d ON d.key = $3
                WHERE m.name = $4 AND s.name = $5
                "#,
            )
            .bind(format!("sbr-{}", new_suffix()))
            .bind(&verb.name)
            .bind(deployment_key)
            .bind(&module.name)
            .bind(&sub.name)
            .execute(&self.pool)
            .await
            .trans()?;
        }
        Ok(())
    }

    /// Append an event to a topic. *Not found* for an unknown topic.
    pub async fn publish_topic_event(
        &self,
        topic: &Ref,
        payload: &[u8],
    ) -> DalResult<i64> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO topic_events (topic_id, payload)
            SELECT t.id, $3
            FROM topics t
            JOIN modules m ON m.id = t.module_id
            WHERE m.name = $1 AND t.name = $2
            RETURNING id
            "#,
        )
        .bind(&topic.module)
        .bind(&topic.name)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await
        .trans()?;
        id.ok_or_else(|| DalError::NotFound(format!("topic {topic}")))
    }

    /// Advance idle subscriptions by one event each, enqueueing a delivery
    /// call per advanced subscription. Each delivery targets one randomly
    /// chosen subscriber. Returns the dispatches made.
    pub async fn progress_subscriptions(&self) -> DalResult<Vec<SubscriptionDispatch>> {
        let mut tx = self.pool.begin().await.trans()?;

        let pending = sqlx::query_as::<_, PendingSubscription>(
            r#"
            SELECT subs.id, m.name AS module_name, subs.name, subs.topic_id, subs.cursor
            FROM topic_subscriptions subs
            JOIN modules m ON m.id = subs.module_id
            WHERE NOT subs.executing
              AND EXISTS (
                  SELECT 1 FROM topic_events e
                  WHERE e.topic_id = subs.topic_id AND e.id > COALESCE(subs.cursor, 0)
              )
            FOR UPDATE OF subs SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .trans()?;

        let mut dispatches = Vec::new();
        for sub in pending {
            let event = sqlx::query_as::<_, NextEvent>(
                r#"
                SELECT id, payload FROM topic_events
                WHERE topic_id = $1 AND id > COALESCE($2, 0)
                ORDER BY id
                LIMIT 1
                "#,
            )
            .bind(sub.topic_id)
            .bind(sub.cursor)
            .fetch_one(&mut *tx)
            .await
            .trans()?;

            let subscriber: Option<(String, String)> = sqlx::query_as(
                r#"
                SELECT m.name, ts.verb
                FROM topic_subscribers ts
                JOIN deployments d ON d.id = ts.deployment_id
                JOIN modules m ON m.id = d.module_id
                WHERE ts.topic_subscriptions_id = $1 AND d.min_replicas > 0
                ORDER BY RANDOM()
                LIMIT 1
                "#,
            )
            .bind(sub.id)
            .fetch_optional(&mut *tx)
            .await
            .trans()?;
            let Some((subscriber_module, subscriber_verb)) = subscriber else {
                // No live subscriber; leave the cursor alone so the event is
                // delivered once one deploys.
                continue;
            };

            let subscription = Ref::new(sub.module_name.clone(), sub.name.clone());
            let verb = Ref::new(subscriber_module, subscriber_verb);
            let origin = AsyncOrigin::PubSub {
                subscription: subscription.clone(),
            };
            let request = serde_json::json!({
                "topic_event_id": event.id,
                "payload_hex": hex::encode(&event.payload),
            });
            let call_id = create_async_call(
                &mut *tx,
                &verb,
                &origin,
                request,
                chrono::Utc::now(),
                RetryParams::default(),
            )
            .await?;

            sqlx::query(
                "UPDATE topic_subscriptions SET cursor = $2, executing = TRUE WHERE id = $1",
            )
            .bind(sub.id)
            .bind(event.id)
            .execute(&mut *tx)
            .await
            .trans()?;

            debug!(subscription = %subscription, verb = %verb, event = event.id, "pubsub delivery enqueued");
            dispatches.push(SubscriptionDispatch {
                subscription,
                subscriber_verb: verb,
                async_call_id: call_id,
                topic_event_id: event.id,
            });
        }

        tx.commit().await.trans()?;
        Ok(dispatches)
    }
}

/// Return a subscription to idle; attached to delivery-call completions.
pub async fn reset_subscription<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    subscription: &Ref,
) -> DalResult<()> {
    sqlx::query(
        r#"
        UPDATE topic_subscriptions subs
        SET executing = FALSE
        FROM modules m
        WHERE m.id = subs.module_id AND m.name = $1 AND subs.name = $2
        "#,
    )
    .bind(&subscription.module)
    .bind(&subscription.name)
    .execute(executor)
    .await
    .trans()?;
    Ok(())
}
