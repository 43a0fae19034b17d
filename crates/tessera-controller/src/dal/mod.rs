// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-access layer over the shared PostgreSQL store.
//!
//! Split by entity: deployments, runners, leases, async calls, FSM
//! instances, ingress, events, pubsub. All fallible operations translate
//! database errors through [`crate::error::DalError::translate`] and return
//! the three-kind taxonomy.

mod async_calls;
mod deployments;
mod events;
pub mod fsm;
mod ingress;
mod leases;
pub mod pubsub;
mod runners;

pub use async_calls::{
    AcquiredCall, AsyncCall, AsyncCallState, AsyncOrigin, CallResult, TxHook, no_hook,
};
pub use deployments::{Artefact, Deployment, Reconciliation};
pub use events::{Event, EventType};
pub use fsm::{FsmInstance, FsmStatus};
pub use ingress::{IngressRoute, RequestOrigin};
pub use leases::Lease;
pub use pubsub::SubscriptionDispatch;
pub use runners::{Controller, ControllerState, Runner, RunnerState};

use sqlx::PgPool;

/// Handle to the typed data-access layer.
#[derive(Clone)]
pub struct Dal {
    pool: PgPool,
}

impl Dal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
