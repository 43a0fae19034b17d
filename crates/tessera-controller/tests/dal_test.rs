// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAL integration tests.
//!
//! These need a PostgreSQL database; set `TEST_DATABASE_URL` to run them.
//! Without it every test silently passes. Tests share the database and are
//! serialized through a global lock, truncating all tables at setup.

use std::sync::OnceLock;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};

use tessera_controller::dal::{AsyncCallState, AsyncOrigin, CallResult, Dal, RunnerState, no_hook};
use tessera_controller::migrations;
use tessera_schema::{Module, Ref, RetryParams};

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

async fn create_deployment(dal: &Dal, module: &str) -> String {
    dal.create_deployment(
        "test",
        &Module::new(module),
        &[],
        serde_json::json!({}),
    )
    .await
    .unwrap()
    .to_string()
}

#[tokio::test]
async fn fsm_transition_single_flight() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    // The queue starts empty.
    let err = dal
        .acquire_async_call(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let fsm = Ref::new("test", "test");
    let dest = Ref::new("module", "verb");
    dal.start_fsm_transition(
        fsm.clone(),
        "invoiceID",
        dest.clone(),
        serde_json::json!({}),
        RetryParams::default(),
    )
    .await
    .unwrap();

    // A second start while the first is in flight is a conflict.
    let err = dal
        .start_fsm_transition(
            fsm.clone(),
            "invoiceID",
            dest.clone(),
            serde_json::json!({}),
            RetryParams::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.to_string(), "transition already executing: conflict");

    let acquired = dal.acquire_async_call(Duration::from_secs(5)).await.unwrap();
    assert!(acquired.lease.key.starts_with("/system/async_call/1:"));
    assert_eq!(acquired.call.verb, dest);
    assert_eq!(
        acquired.call.origin,
        AsyncOrigin::Fsm {
            fsm: fsm.clone(),
            key: "invoiceID".to_string(),
        }
    );
    assert_eq!(acquired.call.request, serde_json::json!({}));

    let id = acquired.call.id;
    dal.complete_async_call(
        acquired,
        CallResult::Success(serde_json::json!({})),
        no_hook(),
    )
    .await
    .unwrap();

    let call = dal.load_async_call(id).await.unwrap();
    assert_eq!(call.state, AsyncCallState::Success);
    assert!(call.lease_id.is_none());
}

#[tokio::test]
async fn instance_lease_blocks_second_acquire() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let fsm = Ref::new("payments", "flow");
    let instance = dal.acquire_fsm_instance(fsm.clone(), "order-1").await.unwrap();
    // Missing rows synthesize as running with no states.
    assert!(instance.current_state.is_none());
    assert!(instance.destination_state.is_none());

    let err = dal
        .acquire_fsm_instance(fsm.clone(), "order-1")
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    instance.lease.release().await.unwrap();
    let instance = dal.acquire_fsm_instance(fsm, "order-1").await.unwrap();
    instance.lease.release().await.unwrap();
}

#[tokio::test]
async fn runner_reservation_expiry() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let deployment = create_deployment(&dal, "echo").await;
    dal.upsert_runner(
        "r1",
        "127.0.0.1:8893",
        RunnerState::Idle,
        serde_json::json!({}),
        None,
    )
    .await
    .unwrap();

    let runner = dal
        .reserve_runner(
            &serde_json::json!({}),
            &deployment,
            chrono::Utc::now() + chrono::Duration::milliseconds(1),
        )
        .await
        .unwrap();
    assert_eq!(runner.key, "r1");
    assert_eq!(runner.state, RunnerState::Reserved);
    assert!(runner.reservation_timeout.is_some());

    // No second idle runner exists.
    let err = dal
        .reserve_runner(
            &serde_json::json!({}),
            &deployment,
            chrono::Utc::now() + chrono::Duration::minutes(2),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let expired = dal.expire_runner_reservations().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].key, "r1");
    assert_eq!(expired[0].state, RunnerState::Idle);
    assert!(expired[0].reservation_timeout.is_none());
}

#[tokio::test]
async fn runner_label_subset_matching() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let deployment = create_deployment(&dal, "echo").await;
    dal.upsert_runner(
        "gpu-runner",
        "127.0.0.1:8895",
        RunnerState::Idle,
        serde_json::json!({"gpu": true, "zone": "a"}),
        None,
    )
    .await
    .unwrap();

    // A runner with a superset of the requested labels matches.
    let err = dal
        .reserve_runner(
            &serde_json::json!({"gpu": true, "zone": "b"}),
            &deployment,
            chrono::Utc::now() + chrono::Duration::minutes(2),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let runner = dal
        .reserve_runner(
            &serde_json::json!({"gpu": true}),
            &deployment,
            chrono::Utc::now() + chrono::Duration::minutes(2),
        )
        .await
        .unwrap();
    assert_eq!(runner.key, "gpu-runner");
}

#[tokio::test]
async fn replace_deploy_respects_single_active_deployment() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let d1 = create_deployment(&dal, "shop").await;
    let d2 = create_deployment(&dal, "shop").await;

    dal.set_deployment_replicas(&d1, 1).await.unwrap();
    dal.replace_deployment(&d1, &d2, 2).await.unwrap();

    assert_eq!(dal.get_deployment(&d2).await.unwrap().min_replicas, 2);
    assert_eq!(dal.get_deployment(&d1).await.unwrap().min_replicas, 0);

    // Re-activating the drained deployment violates the partial unique
    // index while d2 is active.
    let err = dal.set_deployment_replicas(&d1, 1).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn artefact_upload_is_idempotent() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let first = dal.create_artefact(b"module binary").await.unwrap();
    let second = dal.create_artefact(b"module binary").await.unwrap();
    assert_eq!(first, second);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artefacts")
        .fetch_one(dal.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);

    let missing = dal
        .get_artefact_diffs(&[first.clone(), vec![0u8; 32]])
        .await
        .unwrap();
    assert_eq!(missing, vec![vec![0u8; 32]]);
}

#[tokio::test]
async fn artefact_content_ranges_concatenate_to_upload() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    // Content longer than the read window, not a multiple of it.
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let digest = dal.create_artefact(&content).await.unwrap();

    let deployment = dal
        .create_deployment(
            "test",
            &Module::new("echo"),
            &[(digest, "bin/echo".to_string(), true)],
            serde_json::json!({}),
        )
        .await
        .unwrap()
        .to_string();

    let artefacts = dal.get_deployment_artefacts(&deployment).await.unwrap();
    assert_eq!(artefacts.len(), 1);
    assert_eq!(artefacts[0].path, "bin/echo");
    assert!(artefacts[0].executable);

    let mut reassembled = Vec::new();
    let window = 100_000i64;
    loop {
        let chunk = dal
            .get_artefact_content_range(artefacts[0].id, reassembled.len() as i64, window)
            .await
            .unwrap();
        if chunk.is_empty() {
            break;
        }
        reassembled.extend_from_slice(&chunk);
    }
    assert_eq!(reassembled, content);
}

#[tokio::test]
async fn deployment_requires_uploaded_artefacts() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let err = dal
        .create_deployment(
            "test",
            &Module::new("echo"),
            &[(vec![1u8; 32], "bin/echo".to_string(), true)],
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn async_call_retry_with_backoff() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let verb = Ref::new("billing", "charge");
    let origin = AsyncOrigin::Cron { verb: verb.clone() };
    let id = dal
        .create_async_call(
            &verb,
            &origin,
            serde_json::json!({"amount": 10}),
            chrono::Utc::now(),
            RetryParams {
                count: 2,
                min_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_secs(1),
            },
        )
        .await
        .unwrap();

    // First failure: rescheduled with doubled backoff.
    let acquired = dal.acquire_async_call(Duration::from_secs(5)).await.unwrap();
    assert_eq!(acquired.call.id, id);
    assert_eq!(acquired.call.remaining_attempts, 2);
    assert_eq!(acquired.call.backoff, Duration::from_millis(10));
    dal.complete_async_call(acquired, CallResult::Failure("boom".to_string()), no_hook())
        .await
        .unwrap();

    let call = dal.load_async_call(id).await.unwrap();
    assert_eq!(call.state, AsyncCallState::Pending);
    assert_eq!(call.remaining_attempts, 1);
    assert_eq!(call.backoff, Duration::from_millis(20));

    // Second failure after the backoff elapses.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let acquired = dal.acquire_async_call(Duration::from_secs(5)).await.unwrap();
    assert_eq!(acquired.call.id, id);
    dal.complete_async_call(acquired, CallResult::Failure("boom".to_string()), no_hook())
        .await
        .unwrap();

    let call = dal.load_async_call(id).await.unwrap();
    assert_eq!(call.state, AsyncCallState::Pending);
    assert_eq!(call.remaining_attempts, 0);

    // Terminal failure parks the call; nothing is acquirable afterwards.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let acquired = dal.acquire_async_call(Duration::from_secs(5)).await.unwrap();
    dal.complete_async_call(acquired, CallResult::Failure("boom".to_string()), no_hook())
        .await
        .unwrap();

    let call = dal.load_async_call(id).await.unwrap();
    assert_eq!(call.state, AsyncCallState::Error);
    assert_eq!(call.error.as_deref(), Some("boom"));

    let err = dal
        .acquire_async_call(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn expired_lease_makes_call_reclaimable() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let verb = Ref::new("billing", "charge");
    let id = dal
        .create_async_call(
            &verb,
            &AsyncOrigin::Cron { verb: verb.clone() },
            serde_json::json!({}),
            chrono::Utc::now(),
            RetryParams::default(),
        )
        .await
        .unwrap();

    // Acquire with a tiny lease and abandon it (drop stops renewal).
    let acquired = dal
        .acquire_async_call(Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(acquired.call.id, id);
    drop(acquired);

    // Not yet reclaimable: the lease row still exists.
    let err = dal
        .acquire_async_call(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reaped = dal.expire_leases().await.unwrap();
    assert_eq!(reaped, 1);

    // The executing call with a reaped lease acquires like pending.
    let acquired = dal.acquire_async_call(Duration::from_secs(5)).await.unwrap();
    assert_eq!(acquired.call.id, id);
    acquired.lease.release().await.unwrap();
}

#[tokio::test]
async fn lease_acquisition_conflicts_while_held() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let lease = dal
        .acquire_lease("/system/test/one", Duration::from_secs(5))
        .await
        .unwrap();
    let err = dal
        .acquire_lease("/system/test/one", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    lease.release().await.unwrap();
    let lease = dal
        .acquire_lease("/system/test/one", Duration::from_secs(5))
        .await
        .unwrap();
    lease.release().await.unwrap();
}

#[tokio::test]
async fn fsm_finish_promotes_destination_state() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let fsm = Ref::new("orders", "flow");
    let created = Ref::new("orders", "created");
    dal.start_fsm_transition(
        fsm.clone(),
        "o-1",
        created.clone(),
        serde_json::json!({}),
        RetryParams::default(),
    )
    .await
    .unwrap();

    dal.finish_fsm_transition(&fsm, "o-1").await.unwrap();

    let instance = dal.acquire_fsm_instance(fsm.clone(), "o-1").await.unwrap();
    assert_eq!(instance.current_state, Some(created.clone()));
    assert!(instance.destination_state.is_none());
    assert!(instance.async_call_id.is_none());
    instance.lease.release().await.unwrap();

    // Idle again: a new transition may start.
    dal.start_fsm_transition(
        fsm.clone(),
        "o-1",
        Ref::new("orders", "paid"),
        serde_json::json!({}),
        RetryParams::default(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn stale_runners_are_killed() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    dal.upsert_runner(
        "r1",
        "127.0.0.1:8897",
        RunnerState::Idle,
        serde_json::json!({}),
        None,
    )
    .await
    .unwrap();

    // Nothing is stale within a generous interval.
    assert_eq!(dal.kill_stale_runners(60_000).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(dal.kill_stale_runners(10).await.unwrap(), 1);

    // A dead runner frees its endpoint for reuse.
    dal.upsert_runner(
        "r2",
        "127.0.0.1:8897",
        RunnerState::Idle,
        serde_json::json!({}),
        None,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn endpoint_unique_among_live_runners() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    dal.upsert_runner(
        "r1",
        "127.0.0.1:8899",
        RunnerState::Idle,
        serde_json::json!({}),
        None,
    )
    .await
    .unwrap();
    let err = dal
        .upsert_runner(
            "r2",
            "127.0.0.1:8899",
            RunnerState::Idle,
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn call_events_link_to_their_request() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    use tessera_controller::dal::{EventType, RequestOrigin};

    let deployment = create_deployment(&dal, "echo").await;
    let request_key = dal
        .create_request(RequestOrigin::Ingress, "10.0.0.1:4242")
        .await
        .unwrap();
    assert!(request_key.starts_with("ing-"));

    dal.insert_call_event(
        &deployment,
        Some(&request_key),
        None,
        "echo.echo",
        serde_json::json!({"ok": true}),
    )
    .await
    .unwrap();

    let events = dal.get_events(&deployment, 10).await.unwrap();
    // Newest first: the call event, then deployment_created.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::Call);
    assert_eq!(events[0].custom_key_1.as_deref(), Some("echo.echo"));
    assert_eq!(events[1].event_type, EventType::DeploymentCreated);
}

#[tokio::test]
async fn ingress_routes_resolve_by_method_and_path() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    let deployment = create_deployment(&dal, "web").await;
    dal.create_ingress_route(&deployment, "GET", "/orders", "web", "listOrders")
        .await
        .unwrap();

    let routes = dal.get_ingress_routes("GET", "/orders").await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].verb, "listOrders");
    assert!(routes[0].endpoint.is_none());

    assert!(dal.get_ingress_routes("POST", "/orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn pubsub_delivery_advances_cursor_once() {
    let Some((dal, _guard)) = setup().await else {
        return;
    };

    use tessera_schema::{Decl, Subscription, Topic, Type, Verb};

    // billing owns the topic; shop subscribes with a matching verb.
    let billing = Module {
        name: "billing".to_string(),
        comments: vec![],
        decls: vec![Decl::Topic(Topic {
            name: "invoices".to_string(),
            comments: vec![],
            event: Type::String,
        })],
    };
    let shop = Module {
        name: "shop".to_string(),
        comments: vec![],
        decls: vec![
            Decl::Subscription(Subscription {
                name: "invoices".to_string(),
                topic: Ref::new("billing", "invoices"),
            }),
            Decl::Verb(Verb {
                name: "invoices".to_string(),
                comments: vec![],
                export: false,
                request: Type::String,
                response: Type::Unit,
                cron: None,
                ingress: None,
            }),
        ],
    };

    let billing_key = dal
        .create_deployment("test", &billing, &[], serde_json::json!({}))
        .await
        .unwrap()
        .to_string();
    let shop_key = dal
        .create_deployment("test", &shop, &[], serde_json::json!({}))
        .await
        .unwrap()
        .to_string();
    dal.set_deployment_replicas(&billing_key, 1).await.unwrap();
    dal.set_deployment_replicas(&shop_key, 1).await.unwrap();

    dal.create_pubsub_for_module(&billing).await.unwrap();
    dal.create_pubsub_for_module(&shop).await.unwrap();
    dal.create_subscribers_for_deployment(&shop_key, &shop)
        .await
        .unwrap();

    dal.publish_topic_event(&Ref::new("billing", "invoices"), b"evt-1")
        .await
        .unwrap();

    let dispatches = dal.progress_subscriptions().await.unwrap();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].subscription, Ref::new("shop", "invoices"));
    assert_eq!(dispatches[0].subscriber_verb, Ref::new("shop", "invoices"));

    // The subscription is executing; nothing further dispatches until the
    // delivery call completes.
    assert!(dal.progress_subscriptions().await.unwrap().is_empty());

    let acquired = dal.acquire_async_call(Duration::from_secs(5)).await.unwrap();
    assert_eq!(acquired.call.id, dispatches[0].async_call_id);
    let subscription = dispatches[0].subscription.clone();
    dal.complete_async_call(
        acquired,
        CallResult::Success(serde_json::json!({})),
        Box::new(move |conn| {
            Box::pin(async move {
                tessera_controller::dal::pubsub::reset_subscription(&mut *conn, &subscription)
                    .await
            })
        }),
    )
    .await
    .unwrap();

    // Cursor advanced past the only event; idle but nothing new.
    assert!(dal.progress_subscriptions().await.unwrap().is_empty());

    dal.publish_topic_event(&Ref::new("billing", "invoices"), b"evt-2")
        .await
        .unwrap();
    assert_eq!(dal.progress_subscriptions().await.unwrap().len(), 1);
}
