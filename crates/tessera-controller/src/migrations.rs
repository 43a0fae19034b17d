// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! Processes embedding the controller (tests, `box run`) call
//! [`run_postgres`] to set up the schema; already-applied migrations are
//! skipped.

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all controller migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run PostgreSQL migrations. Safe to call repeatedly.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
