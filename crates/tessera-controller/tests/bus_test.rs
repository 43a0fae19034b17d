// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema bus and cron scheduler integration tests.
//!
//! Need `TEST_DATABASE_URL`; silently pass without it.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};

use tessera_controller::bus::{ChangeType, SchemaBus};
use tessera_controller::cron::CronScheduler;
use tessera_controller::dal::Dal;
use tessera_controller::migrations;
use tessera_schema::{Decl, Module, Type, Verb};

static LOCK: OnceLock<Mutex<()>> = OnceLock::new();

async fn setup() -> Option<(Dal, MutexGuard<'static, ()>)> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let guard = LOCK.get_or_init(|| Mutex::new(())).lock().await;
    let pool = PgPool::connect(&url).await.ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    sqlx::raw_sql(
        "TRUNCATE modules, deployments, artefacts, deployment_artefacts, runners, \
         controllers, ingress_routes, requests, events, topics, topic_events, \
         topic_subscriptions, topic_subscribers, leases, async_calls, fsm_instances \
         RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .ok()?;
    Some((Dal::new(pool), guard))
}

#[tokio::test]
async fn deployment_lifecycle_reaches_schema_subscribers() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let bus = Arc::new(SchemaBus::new());
    let mut changes = bus.subscribe().await;
    tokio::spawn(bus.clone().run(dal.clone()));
    // Let the listener attach before generating notifications.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let key = dal
        .create_deployment("test", &Module::new("echo"), &[], serde_json::json!({}))
        .await
        .unwrap()
        .to_string();

    let added = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no Added notification")
        .unwrap();
    assert_eq!(added.change, ChangeType::Added);
    assert_eq!(added.deployment_key, key);
    assert_eq!(added.module_name, "echo");
    assert!(added.schema.is_some());

    dal.set_deployment_replicas(&key, 1).await.unwrap();
    let changed = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no Changed notification")
        .unwrap();
    assert_eq!(changed.change, ChangeType::Changed);

    dal.set_deployment_replicas(&key, 0).await.unwrap();
    let removed = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no Removed notification")
        .unwrap();
    assert_eq!(removed.change, ChangeType::Removed);
    assert!(removed.schema.is_none());

    bus.shutdown_handle().notify_waiters();
}

#[tokio::test]
async fn cron_scan_enqueues_one_call_per_verb() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let module = Module {
        name: "time".to_string(),
        comments: vec![],
        decls: vec![Decl::Verb(Verb {
            name: "tick".to_string(),
            comments: vec![],
            export: false,
            request: Type::Unit,
            response: Type::Unit,
            cron: Some("every 10s".to_string()),
            ingress: None,
        })],
    };
    let key = dal
        .create_deployment("test", &module, &[], serde_json::json!({}))
        .await
        .unwrap()
        .to_string();
    dal.set_deployment_replicas(&key, 1).await.unwrap();

    let scheduler = CronScheduler::new(dal.clone(), Duration::from_secs(60));
    assert_eq!(scheduler.scan(chrono::Utc::now()).await.unwrap(), 1);
    // Idempotent while the call is outstanding.
    assert_eq!(scheduler.scan(chrono::Utc::now()).await.unwrap(), 0);

    let pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM async_calls WHERE origin = 'cron:time.tick'")
            .fetch_one(dal.pool())
            .await
            .unwrap();
    assert_eq!(pending, 1);
}
