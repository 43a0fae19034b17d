// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Controller - deployment and execution coordination
//!
//! The controller owns the shared PostgreSQL store and everything layered on
//! it: the deployment store and artefact CAS, the runner scheduler, the
//! lease-protected async-call queue with its FSM executor, and the schema
//! distribution bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │   Build Engine / CLI     │        │         Runners          │
//! │  (tessera-buildengine)   │        │  (verb hosts, heartbeat) │
//! └──────────────────────────┘        └──────────────────────────┘
//!        │ Controller Protocol                │ Runner Protocol
//!        ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     tessera-controller                      │
//! │  RPC services │ Reconciler │ Executor │ Cron │ Pub/sub      │
//! │               │            │          │      │ Schema bus   │
//! │               └────── DAL (three-kind errors) ──────┘       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────┐
//!                    │    PostgreSQL    │
//!                    └──────────────────┘
//! ```
//!
//! Multiple controllers may run against one database; every cross-process
//! invariant (single active deployment per module, FSM single-flight, one
//! endpoint per live runner) is a database constraint, surfaced through the
//! [`error::DalError`] taxonomy.

pub mod bus;
pub mod clients;
pub mod config;
pub mod cron;
pub mod daemon;
pub mod dal;
pub mod error;
pub mod executor;
pub mod keys;
pub mod migrations;
pub mod pubsub;
pub mod reconciler;
pub mod scaling;
pub mod server;
