//! SQLite-backed persistence implementation.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::channel::{MessageChannel, MessageSource, QueuedMessage, deliver_at};
use crate::error::CoreError;
use crate::message::Message;
use crate::migrations::SQLITE as MIGRATOR;
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

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/autoreduce.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Set the paused flag of an instrument.
    pub async fn set_instrument_paused(&self, name: &str, paused: bool) -> Result<(), CoreError> {
        sqlx::query("UPDATE instruments SET is_paused = ? WHERE name = ?")
            .bind(paused)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Insert a run through `executor`.
async fn insert_run_row<'e, E>(
    executor: E,
    run: &NewReductionRun,
) -> Result<ReductionRunRecord, CoreError>
where
    E: SqliteExecutor<'e>,
{
    let now = Utc::now();
    let query = format!(
        r#"
        INSERT INTO reduction_runs (
            experiment_id, instrument_id, run_number, run_version, run_name, status,
            created, last_updated, script, started_by
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .bind(now)
        .bind(now)
        .bind(&run.script)
        .bind(run.started_by)
        .fetch_one(executor)
        .await?;

    Ok(record)
}

#[async_trait::async_trait]
impl Directory for SqlitePersistence {
    async fn get_or_create_experiment(
        &self,
        rb_number: &str,
    ) -> Result<ExperimentRecord, CoreError> {
        sqlx::query("INSERT INTO experiments (reference_number) VALUES (?) ON CONFLICT (reference_number) DO NOTHING")
            .bind(rb_number)
            .execute(&self.pool)
            .await?;

        let record = sqlx::query_as::<_, ExperimentRecord>(
            "SELECT id, reference_number FROM experiments WHERE reference_number = ?",
        )
        .bind(rb_number)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_experiment(
        &self,
        rb_number: &str,
    ) -> Result<Option<ExperimentRecord>, CoreError> {
        let record = sqlx::query_as::<_, ExperimentRecord>(
            "SELECT id, reference_number FROM experiments WHERE reference_number = ?",
        )
        .bind(rb_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn experiment_by_id(&self, id: i64) -> Result<Option<ExperimentRecord>, CoreError> {
        let record = sqlx::query_as::<_, ExperimentRecord>(
            "SELECT id, reference_number FROM experiments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_or_create_instrument(&self, name: &str) -> Result<InstrumentRecord, CoreError> {
        sqlx::query("INSERT INTO instruments (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;

        let mut record = sqlx::query_as::<_, InstrumentRecord>(
            "SELECT id, name, is_active, is_paused FROM instruments WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        if !record.is_active {
            info!(instrument = %name, "Activating instrument");
            sqlx::query("UPDATE instruments SET is_active = 1 WHERE id = ?")
                .bind(record.id)
                .execute(&self.pool)
                .await?;
            record.is_active = true;
        }

        Ok(record)
    }

    async fn instrument_by_id(&self, id: i64) -> Result<Option<InstrumentRecord>, CoreError> {
        let record = sqlx::query_as::<_, InstrumentRecord>(
            "SELECT id, name, is_active, is_paused FROM instruments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_status(&self, name: &str) -> Result<Status, CoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM statuses WHERE value = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        value
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown reduction status '{}'", name),
            })
    }
}

#[async_trait::async_trait]
impl RunStore for SqlitePersistence {
    async fn find_run(
        &self,
        experiment_id: i64,
        run_number: i64,
        run_version: i32,
    ) -> Result<Option<ReductionRunRecord>, CoreError> {
        let query = format!(
            "SELECT {} FROM reduction_runs WHERE experiment_id = ? AND run_number = ? AND run_version = ?",
            RUN_COLUMNS
        );
        let record = sqlx::query_as::<_, ReductionRunRecord>(&query)
            .bind(experiment_id)
            .bind(run_number)
            .bind(run_version)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn latest_version(&self, experiment_id: i64, run_number: i64) -> Result<i32, CoreError> {
        let version: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT run_version FROM reduction_runs
            WHERE experiment_id = ? AND run_number = ?
            ORDER BY run_version DESC
            LIMIT 1
            "#,
        )
        .bind(experiment_id)
        .bind(run_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.unwrap_or(-1))
    }

    async fn insert_run(&self, run: &NewReductionRun) -> Result<ReductionRunRecord, CoreError> {
        insert_run_row(&self.pool, run).await
    }

    async fn save_run(&self, run: &ReductionRunRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE reduction_runs
            SET run_name = ?, status = ?, last_updated = ?, started = ?, finished = ?,
                message = ?, reduction_log = ?, admin_log = ?, script = ?, cancel = ?,
                hidden_in_failviewer = ?, started_by = ?, retry_when = ?, retry_run_id = ?
            WHERE id = ?
            "#,
        )
        .bind(&run.run_name)
        .bind(run.status.as_str())
        .bind(Utc::now())
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_data_location(&self, run_id: i64, file_path: &str) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO data_locations (file_path, reduction_run_id) VALUES (?, ?)")
            .bind(file_path)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_reduction_location(
        &self,
        run_id: i64,
        file_path: &str,
    ) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO reduction_locations (file_path, reduction_run_id) VALUES (?, ?)")
            .bind(file_path)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn data_locations(&self, run_id: i64) -> Result<Vec<String>, CoreError> {
        let paths = sqlx::query_scalar(
            "SELECT file_path FROM data_locations WHERE reduction_run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn reduction_locations(&self, run_id: i64) -> Result<Vec<String>, CoreError> {
        let paths = sqlx::query_scalar(
            "SELECT file_path FROM reduction_locations WHERE reduction_run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn create_retry_version(
        &self,
        run: &ReductionRunRecord,
        started_by: Option<i64>,
        delay: Duration,
    ) -> Result<ReductionRunRecord, CoreError> {
        let retry_when = retry_due(delay)?;
        let mut tx = self.pool.begin().await?;

        let run_version: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(run_version), -1) + 1 FROM reduction_runs
            WHERE experiment_id = ? AND run_number = ?
            "#,
        )
        .bind(run.experiment_id)
        .bind(run.run_number)
        .fetch_one(&mut *tx)
        .await?;

        let retry = insert_run_row(&mut *tx, &retry_of(run, run_version, started_by)).await?;

        sqlx::query(
            r#"
            INSERT INTO data_locations (file_path, reduction_run_id)
            SELECT file_path, ? FROM data_locations WHERE reduction_run_id = ? ORDER BY id
            "#,
        )
        .bind(retry.id)
        .bind(run.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE reduction_runs SET retry_when = ?, retry_run_id = ?, last_updated = ? WHERE id = ?",
        )
        .bind(retry_when)
        .bind(retry.id)
        .bind(Utc::now())
        .bind(run.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(retry)
    }
}

#[async_trait::async_trait]
impl MessageChannel for SqlitePersistence {
    async fn publish_delayed(
        &self,
        destination: &str,
        message: &Message,
        delay: Duration,
    ) -> Result<(), CoreError> {
        let payload = message.to_json()?;
        sqlx::query(
            "INSERT INTO queue_messages (destination, payload, deliver_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(destination)
        .bind(payload)
        .bind(deliver_at(delay))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::PublishFailed {
            destination: destination.to_string(),
            details: e.to_string(),
        })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageSource for SqlitePersistence {
    async fn fetch_due(
        &self,
        destinations: &[String],
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, CoreError> {
        if destinations.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, destination, payload, deliver_at, created_at FROM queue_messages WHERE deliver_at <= ",
        );
        builder.push_bind(Utc::now());
        builder.push(" AND destination IN (");
        let mut separated = builder.separated(", ");
        for destination in destinations {
            separated.push_bind(destination);
        }
        separated.push_unseparated(") ORDER BY deliver_at, id LIMIT ");
        builder.push_bind(limit);

        let messages = builder
            .build_query_as::<QueuedMessage>()
            .fetch_all(&self.pool)
            .await?;

        Ok(messages)
    }

    async fn ack(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
