// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence operations for autoreduce-core on PostgreSQL.
//!
//! Provides storage access functions for experiments, instruments, reduction
//! runs, their locations, and the durable message queue.

use std::time::Duration;

use chrono::Utc;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use tracing::info;

use crate::channel::{MessageChannel, MessageSource, QueuedMessage, deliver_at};
use crate::error::CoreError;
use crate::message::Message;
use crate::status::Status;

use super::{
    Directory, ExperimentRecord, InstrumentRecord, NewReductionRun, ReductionRunRecord, RunStore,
    retry_due, retry_of,
};

const RUN_COLUMNS: &str = r#"
    id, experiment_id, instrument_id, run_number, run_version, run_name, status,
    created, last_updated, started, finished, message, reduction_log, admin_log,
    script, cancel, hidden_in_failviewer, started_by, retry_when, retry_run_id
"#;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Experiment / Instrument Operations
// ============================================================================

/// Get the experiment for an RB number, creating it if needed.
pub async fn get_or_create_experiment(
    pool: &PgPool,
    rb_number: &str,
) -> Result<ExperimentRecord, CoreError> {
    sqlx::query(
        r#"
        INSERT INTO experiments (reference_number)
        VALUES ($1)
        ON CONFLICT (reference_number) DO NOTHING
        "#,
    )
    .bind(rb_number)
    .execute(pool)
    .await?;

    let record = sqlx::query_as::<_, ExperimentRecord>(
        "SELECT id, reference_number FROM experiments WHERE reference_number = $1",
    )
    .bind(rb_number)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Get the experiment for an RB number.
pub async fn get_experiment(
    pool: &PgPool,
    rb_number: &str,
) -> Result<Option<ExperimentRecord>, CoreError> {
    let record = sqlx::query_as::<_, ExperimentRecord>(
        "SELECT id, reference_number FROM experiments WHERE reference_number = $1",
    )
    .bind(rb_number)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get an experiment by ID.
pub async fn get_experiment_by_id(
    pool: &PgPool,
    id: i64,
) -> Result<Option<ExperimentRecord>, CoreError> {
    let record = sqlx::query_as::<_, ExperimentRecord>(
        "SELECT id, reference_number FROM experiments WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get an instrument by name, creating it if needed and activating it if inactive.
pub async fn get_or_create_instrument(
    pool: &PgPool,
    name: &str,
) -> Result<InstrumentRecord, CoreError> {
    sqlx::query(
        r#"
        INSERT INTO instruments (name)
        VALUES ($1)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(name)
    .execute(pool)
    .await?;

    let mut record = sqlx::query_as::<_, InstrumentRecord>(
        "SELECT id, name, is_active, is_paused FROM instruments WHERE name = $1",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;

    if !record.is_active {
        info!(instrument = %name, "Activating instrument");
        sqlx::query("UPDATE instruments SET is_active = TRUE WHERE id = $1")
            .bind(record.id)
            .execute(pool)
            .await?;
        record.is_active = true;
    }

    Ok(record)
}

/// Get an instrument by ID.
pub async fn get_instrument_by_id(
    pool: &PgPool,
    id: i64,
) -> Result<Option<InstrumentRecord>, CoreError> {
    let record = sqlx::query_as::<_, InstrumentRecord>(
        "SELECT id, name, is_active, is_paused FROM instruments WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Resolve a status name against the statuses table.
pub async fn get_status(pool: &PgPool, name: &str) -> Result<Status, CoreError> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM statuses WHERE value = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;

    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CoreError::ValidationError {
            field: "status".to_string(),
            message: format!("unknown reduction status '{}'", name),
        })
}

// ============================================================================
// Reduction Run Operations
// ============================================================================

/// Find a run by (experiment, run number, run version).
pub async fn find_run(
    pool: &PgPool,
    experiment_id: i64,
    run_number: i64,
    run_version: i32,
) -> Result<Option<ReductionRunRecord>, CoreError> {
    let query = format!(
        r#"
        SELECT {}
        FROM reduction_runs
        WHERE experiment_id = $1 AND run_number = $2 AND run_version = $3
        "#,
        RUN_COLUMNS
    );
    let record = sqlx::query_as::<_, ReductionRunRecord>(&query)
        .bind(experiment_id)
        .bind(run_number)
        .bind(run_version)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Latest version of a run, -1 if none exists.
pub async fn latest_version(
    pool: &PgPool,
    experiment_id: i64,
    run_number: i64,
) -> Result<i32, CoreError> {
    let version: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT run_version FROM reduction_runs
        WHERE experiment_id = $1 AND run_number = $2
        ORDER BY run_version DESC
        LIMIT 1
        "#,
    )
    .bind(experiment_id)
    .bind(run_number)
    .fetch_optional(pool)
    .await?;

    Ok(version.unwrap_or(-1))
}

/// Insert a new run.
pub async fn insert_run<'e, E>(
    executor: E,
    run: &NewReductionRun,
) -> Result<ReductionRunRecord, CoreError>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        r#"
        INSERT INTO reduction_runs (
            experiment_id, instrument_id, run_number, run_version, run_name, status,
            created, last_updated, script, started_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW(), $7, $8)
        RETURNING {}
        "#,
        RUN_COLUMNS
    );
    let record = sqlx::query_as::<_, ReductionRunRecord>(&query)
        .bind(run.experiment_id)
        .bind(run.instrument_id)
        .bind(run.run_number)
        .bind(run.run_version)
        .bind(&run.run_name)
        .bind(run.status.as_str())
        .bind(&run.script)
        .bind(run.started_by)
        .fetch_one(executor)
        .await?;

    Ok(record)
}

/// Write back the mutable fields of a run.
pub async fn save_run(pool: &PgPool, run: &ReductionRunRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE reduction_runs
        SET run_name = $1, status = $2, last_updated = NOW(), started = $3, finished = $4,
            message = $5, reduction_log = $6, admin_log = $7, script = $8, cancel = $9,
            hidden_in_failviewer = $10, started_by = $11, retry_when = $12, retry_run_id = $13
        WHERE id = $14
        "#,
    )
    .bind(&run.run_name)
    .bind(run.status.as_str())
    .bind(run.started)
    .bind(run.finished)
    .bind(&run.message)
    .bind(&run.reduction_log)
    .bind(&run.admin_log)
    .bind(&run.script)
    .bind(run.cancel)
    .bind(run.hidden_in_failviewer)
    .bind(run.started_by)
    .bind(run.retry_when)
    .bind(run.retry_run_id)
    .bind(run.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the retry version of `run` in one transaction.
///
/// Inserts the next version as Queued, copies the data locations of `run` and
/// links `run` to the new version.
pub async fn create_retry_version(
    pool: &PgPool,
    run: &ReductionRunRecord,
    started_by: Option<i64>,
    delay: Duration,
) -> Result<ReductionRunRecord, CoreError> {
    let retry_when = retry_due(delay)?;
    let mut tx = pool.begin().await?;

    let run_version: i32 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(MAX(run_version), -1) + 1 FROM reduction_runs
        WHERE experiment_id = $1 AND run_number = $2
        "#,
    )
    .bind(run.experiment_id)
    .bind(run.run_number)
    .fetch_one(&mut *tx)
    .await?;

    let retry = insert_run(&mut *tx, &retry_of(run, run_version, started_by)).await?;

    sqlx::query(
        r#"
        INSERT INTO data_locations (file_path, reduction_run_id)
        SELECT file_path, $1 FROM data_locations WHERE reduction_run_id = $2 ORDER BY id
        "#,
    )
    .bind(retry.id)
    .bind(run.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE reduction_runs
        SET retry_when = $1, retry_run_id = $2, last_updated = NOW()
        WHERE id = $3
        "#,
    )
    .bind(retry_when)
    .bind(retry.id)
    .bind(run.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(retry)
}

/// Append a location row to `table` (data_locations or reduction_locations).
async fn add_location(
    pool: &PgPool,
    table: &'static str,
    run_id: i64,
    file_path: &str,
) -> Result<(), CoreError> {
    let query = format!(
        "INSERT INTO {} (file_path, reduction_run_id) VALUES ($1, $2)",
        table
    );
    sqlx::query(&query)
        .bind(file_path)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// List location paths of a run from `table`.
async fn list_locations(
    pool: &PgPool,
    table: &'static str,
    run_id: i64,
) -> Result<Vec<String>, CoreError> {
    let query = format!(
        "SELECT file_path FROM {} WHERE reduction_run_id = $1 ORDER BY id",
        table
    );
    let paths = sqlx::query_scalar(&query)
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    Ok(paths)
}

// ============================================================================
// Queue Operations
// ============================================================================

/// Insert a message for delivery at now + `delay`.
pub async fn enqueue(
    pool: &PgPool,
    destination: &str,
    payload: &str,
    delay: Duration,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO queue_messages (destination, payload, deliver_at, created_at)
        VALUES ($1, $2, $3, NOW())
        "#,
    )
    .bind(destination)
    .bind(payload)
    .bind(deliver_at(delay))
    .execute(pool)
    .await?;

    Ok(())
}

/// Due messages on the given destinations, oldest first.
pub async fn fetch_due(
    pool: &PgPool,
    destinations: &[String],
    limit: i64,
) -> Result<Vec<QueuedMessage>, CoreError> {
    if destinations.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT id, destination, payload, deliver_at, created_at FROM queue_messages WHERE deliver_at <= ",
    );
    builder.push_bind(Utc::now());
    builder.push(" AND destination = ANY(");
    builder.push_bind(destinations.to_vec());
    builder.push(") ORDER BY deliver_at, id LIMIT ");
    builder.push_bind(limit);

    let messages = builder
        .build_query_as::<QueuedMessage>()
        .fetch_all(pool)
        .await?;

    Ok(messages)
}

/// Delete a delivered message.
pub async fn delete_message(pool: &PgPool, id: i64) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM queue_messages WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait::async_trait]
impl Directory for PostgresPersistence {
    async fn get_or_create_experiment(
        &self,
        rb_number: &str,
    ) -> Result<ExperimentRecord, CoreError> {
        get_or_create_experiment(&self.pool, rb_number).await
    }

    async fn get_experiment(
        &self,
        rb_number: &str,
    ) -> Result<Option<ExperimentRecord>, CoreError> {
        get_experiment(&self.pool, rb_number).await
    }

    async fn experiment_by_id(&self, id: i64) -> Result<Option<ExperimentRecord>, CoreError> {
        get_experiment_by_id(&self.pool, id).await
    }

    async fn get_or_create_instrument(&self, name: &str) -> Result<InstrumentRecord, CoreError> {
        get_or_create_instrument(&self.pool, name).await
    }

    async fn instrument_by_id(&self, id: i64) -> Result<Option<InstrumentRecord>, CoreError> {
        get_instrument_by_id(&self.pool, id).await
    }

    async fn get_status(&self, name: &str) -> Result<Status, CoreError> {
        get_status(&self.pool, name).await
    }
}

#[async_trait::async_trait]
impl RunStore for PostgresPersistence {
    async fn find_run(
        &self,
        experiment_id: i64,
        run_number: i64,
        run_version: i32,
    ) -> Result<Option<ReductionRunRecord>, CoreError> {
        find_run(&self.pool, experiment_id, run_number, run_version).await
    }

    async fn latest_version(&self, experiment_id: i64, run_number: i64) -> Result<i32, CoreError> {
        latest_version(&self.pool, experiment_id, run_number).await
    }

    async fn insert_run(&self, run: &NewReductionRun) -> Result<ReductionRunRecord, CoreError> {
        insert_run(&self.pool, run).await
    }

    async fn save_run(&self, run: &ReductionRunRecord) -> Result<(), CoreError> {
        save_run(&self.pool, run).await
    }

    async fn add_data_location(&self, run_id: i64, file_path: &str) -> Result<(), CoreError> {
        add_location(&self.pool, "data_locations", run_id, file_path).await
    }

    async fn add_reduction_location(
        &self,
        run_id: i64,
        file_path: &str,
    ) -> Result<(), CoreError> {
        add_location(&self.pool, "reduction_locations", run_id, file_path).await
    }

    async fn data_locations(&self, run_id: i64) -> Result<Vec<String>, CoreError> {
        list_locations(&self.pool, "data_locations", run_id).await
    }

    async fn reduction_locations(&self, run_id: i64) -> Result<Vec<String>, CoreError> {
        list_locations(&self.pool, "reduction_locations", run_id).await
    }

    async fn create_retry_version(
        &self,
        run: &ReductionRunRecord,
        started_by: Option<i64>,
        delay: Duration,
    ) -> Result<ReductionRunRecord, CoreError> {
        create_retry_version(&self.pool, run, started_by, delay).await
    }
}

#[async_trait::async_trait]
impl MessageChannel for PostgresPersistence {
    async fn publish_delayed(
        &self,
        destination: &str,
        message: &Message,
        delay: Duration,
    ) -> Result<(), CoreError> {
        let payload = message.to_json()?;
        enqueue(&self.pool, destination, &payload, delay)
            .await
            .map_err(|e| CoreError::PublishFailed {
                destination: destination.to_string(),
                details: e.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl MessageSource for PostgresPersistence {
    async fn fetch_due(
        &self,
        destinations: &[String],
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, CoreError> {
        fetch_due(&self.pool, destinations, limit).await
    }

    async fn ack(&self, id: i64) -> Result<(), CoreError> {
        delete_message(&self.pool, id).await
    }
}
