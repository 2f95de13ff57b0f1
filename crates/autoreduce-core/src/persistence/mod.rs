//! Persistence interfaces and backends for autoreduce-core.
//!
//! This module defines the directory and run store abstractions used by the
//! lifecycle handlers and their backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::CoreError;
use crate::status::Status;

/// Experiment record, keyed by RB number.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ExperimentRecord {
    /// Database primary key.
    pub id: i64,
    /// RB number.
    pub reference_number: String,
}

/// Instrument record, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InstrumentRecord {
    /// Database primary key.
    pub id: i64,
    /// Instrument name.
    pub name: String,
    /// Whether the instrument has been seen by the pipeline.
    pub is_active: bool,
    /// Paused instruments get their runs created as Skipped and never queued.
    pub is_paused: bool,
}

/// One version of the reduction of one run.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReductionRunRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning experiment.
    pub experiment_id: i64,
    /// Instrument the data came from.
    pub instrument_id: i64,
    /// Run number.
    pub run_number: i64,
    /// Attempt counter within (experiment, run number).
    pub run_version: i32,
    /// Free text description.
    pub run_name: String,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: Status,
    /// When the run was created.
    pub created: DateTime<Utc>,
    /// When the record was last written.
    pub last_updated: DateTime<Utc>,
    /// When a reduction worker started the run.
    pub started: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished: Option<DateTime<Utc>>,
    /// Last status note.
    pub message: Option<String>,
    /// Reduction output log.
    pub reduction_log: String,
    /// Admin log.
    pub admin_log: String,
    /// Script text snapshot taken when the run was created.
    pub script: String,
    /// Set by operators to stop further retries.
    pub cancel: bool,
    /// Hidden from the failed runs view.
    pub hidden_in_failviewer: bool,
    /// User that triggered the run.
    pub started_by: Option<i64>,
    /// When a scheduled retry of this run is due.
    pub retry_when: Option<DateTime<Utc>>,
    /// Run version created by the retry.
    pub retry_run_id: Option<i64>,
}

/// Fields needed to create a reduction run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReductionRun {
    /// Owning experiment.
    pub experiment_id: i64,
    /// Instrument the data came from.
    pub instrument_id: i64,
    /// Run number.
    pub run_number: i64,
    /// Run version.
    pub run_version: i32,
    /// Free text description.
    pub run_name: String,
    /// Initial status.
    pub status: Status,
    /// Script text snapshot.
    pub script: String,
    /// User that triggered the run.
    pub started_by: Option<i64>,
}

/// Experiment and instrument lookups.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Find the experiment for an RB number, creating it when absent.
    async fn get_or_create_experiment(
        &self,
        rb_number: &str,
    ) -> Result<ExperimentRecord, CoreError>;

    /// Find the experiment for an RB number.
    async fn get_experiment(&self, rb_number: &str)
    -> Result<Option<ExperimentRecord>, CoreError>;

    /// Find an experiment by primary key.
    async fn experiment_by_id(&self, id: i64) -> Result<Option<ExperimentRecord>, CoreError>;

    /// Find the instrument by name, creating it when absent. An inactive
    /// instrument is activated as a side effect.
    async fn get_or_create_instrument(&self, name: &str) -> Result<InstrumentRecord, CoreError>;

    /// Find an instrument by primary key.
    async fn instrument_by_id(&self, id: i64) -> Result<Option<InstrumentRecord>, CoreError>;

    /// Resolve a status name.
    async fn get_status(&self, name: &str) -> Result<Status, CoreError> {
        name.parse::<Status>()
            .map_err(|e| CoreError::ValidationError {
                field: "status".to_string(),
                message: e.to_string(),
            })
    }
}

/// Reduction run storage.
///
/// The store must enforce uniqueness of (experiment_id, run_number, run_version).
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Exact match on (experiment, run number, run version).
    async fn find_run(
        &self,
        experiment_id: i64,
        run_number: i64,
        run_version: i32,
    ) -> Result<Option<ReductionRunRecord>, CoreError>;

    /// Highest existing version for (experiment, run number), or -1 when the
    /// run has never been reduced so callers can blindly add one.
    async fn latest_version(&self, experiment_id: i64, run_number: i64) -> Result<i32, CoreError>;

    /// Insert a new run.
    async fn insert_run(&self, run: &NewReductionRun) -> Result<ReductionRunRecord, CoreError>;

    /// Write back every mutable field of an existing run. `last_updated` is
    /// set by the store.
    async fn save_run(&self, run: &ReductionRunRecord) -> Result<(), CoreError>;

    /// Record where the input data of a run lives.
    async fn add_data_location(&self, run_id: i64, file_path: &str) -> Result<(), CoreError>;

    /// Record where reduced output of a run was written.
    async fn add_reduction_location(&self, run_id: i64, file_path: &str)
    -> Result<(), CoreError>;

    /// Input data paths of a run, in insertion order.
    async fn data_locations(&self, run_id: i64) -> Result<Vec<String>, CoreError>;

    /// Output paths of a run, in insertion order.
    async fn reduction_locations(&self, run_id: i64) -> Result<Vec<String>, CoreError>;

    /// Create the next version of `run` for a retry.
    ///
    /// The new version is Queued, keeps the script snapshot and data locations of
    /// `run`, and is attributed to `started_by`. `run` is updated to point at the
    /// new version and to record when the retry is due.
    ///
    /// Backends should override this to do all writes in one transaction. Here a
    /// failure after the new version was inserted is reported as
    /// [`CoreError::RetryPublishFailed`], since that version will never be queued.
    async fn create_retry_version(
        &self,
        run: &ReductionRunRecord,
        started_by: Option<i64>,
        delay: Duration,
    ) -> Result<ReductionRunRecord, CoreError> {
        let retry_when = retry_due(delay)?;
        let run_version = self.latest_version(run.experiment_id, run.run_number).await? + 1;
        let retry = self.insert_run(&retry_of(run, run_version, started_by)).await?;

        let linked = async {
            for path in self.data_locations(run.id).await? {
                self.add_data_location(retry.id, &path).await?;
            }
            let mut previous = run.clone();
            previous.retry_when = Some(retry_when);
            previous.retry_run_id = Some(retry.id);
            self.save_run(&previous).await
        }
        .await;

        match linked {
            Ok(()) => Ok(retry),
            Err(e) => Err(CoreError::RetryPublishFailed {
                run_number: retry.run_number,
                run_version: retry.run_version,
                details: e.to_string(),
            }),
        }
    }
}

/// New run record for the retry of `run`.
pub(crate) fn retry_of(
    run: &ReductionRunRecord,
    run_version: i32,
    started_by: Option<i64>,
) -> NewReductionRun {
    NewReductionRun {
        experiment_id: run.experiment_id,
        instrument_id: run.instrument_id,
        run_number: run.run_number,
        run_version,
        run_name: run.run_name.clone(),
        status: Status::Queued,
        script: run.script.clone(),
        started_by,
    }
}

/// When a retry scheduled `delay` from now is due.
pub(crate) fn retry_due(delay: Duration) -> Result<DateTime<Utc>, CoreError> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| CoreError::ValidationError {
            field: "retry_in".to_string(),
            message: format!("retry delay of {}s is out of range", delay.as_secs()),
        })
}
