// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations.
//!
//! Both schemas hold the same tables: `statuses` (seeded), `experiments`,
//! `instruments`, `reduction_runs`, `data_locations`, `reduction_locations`
//! and the `queue_messages` table backing the lifecycle queue.
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! autoreduce_core::migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// PostgreSQL schema.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite schema.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Bring a PostgreSQL database up to date. Applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Bring a SQLite database up to date. Applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
