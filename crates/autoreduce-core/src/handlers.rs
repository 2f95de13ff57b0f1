// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reduction run lifecycle handlers.
//!
//! One handler per consumed destination. Each reads and writes the run store,
//! consults the directory and script resolver, and publishes follow-up
//! messages on the channel.
//!
//! Handlers return an [`Outcome`] for anything that is a normal result of
//! processing a message, including messages that turn out to be out of order.
//! `Err` is reserved for store/channel failures, and only
//! [`CoreError::RetryPublishFailed`] is fatal.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::MessageChannel;
use crate::config::{DEFAULT_MAX_RETRY_VERSION, QueueNames};
use crate::error::CoreError;
use crate::message::{Destination, Message, RbNumber, is_valid_rb};
use crate::persistence::{Directory, NewReductionRun, ReductionRunRecord, RunStore};
use crate::script::ScriptResolver;
use crate::status::Status;

/// Shared state for lifecycle handlers.
///
/// Holds the collaborators every handler works against.
pub struct HandlerState {
    /// Experiment, instrument and status lookups.
    pub directory: Arc<dyn Directory>,
    /// Reduction run storage.
    pub store: Arc<dyn RunStore>,
    /// Reduction script lookups.
    pub scripts: Arc<dyn ScriptResolver>,
    /// Outbound messages.
    pub channel: Arc<dyn MessageChannel>,
    /// Destination tags.
    pub queues: QueueNames,
    /// Highest existing run version that may still be retried.
    pub max_retry_version: i32,
}

impl HandlerState {
    /// Create handler state with default queue names and retry limit.
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<dyn RunStore>,
        scripts: Arc<dyn ScriptResolver>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            directory,
            store,
            scripts,
            channel,
            queues: QueueNames::default(),
            max_retry_version: DEFAULT_MAX_RETRY_VERSION,
        }
    }

    /// Use custom destination tags.
    pub fn with_queues(mut self, queues: QueueNames) -> Self {
        self.queues = queues;
        self
    }

    /// Use a custom retry limit.
    pub fn with_max_retry_version(mut self, max_retry_version: i32) -> Self {
        self.max_retry_version = max_retry_version;
        self
    }
}

/// Result of handling one message.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The message changed run state.
    Applied,
    /// The message was consumed without changing run state.
    NoOp(CoreError),
    /// The handler failed and the failure was contained.
    Failed(CoreError),
}

impl Outcome {
    /// Whether run state changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

// ============================================================================
// Data Ready
// ============================================================================

/// Handle a data-ready message.
///
/// Creates the next version of the run, records where its data lives and
/// queues it for reduction. The assigned version and the script with its
/// arguments are written back to `message`.
///
/// Runs of paused instruments are created as Skipped and not queued. Runs with
/// an invalid RB number are created and then sent to the skipped destination.
/// When the instrument has no reduction script, the message is passed to
/// [`handle_reduction_error`] and no run is created.
#[instrument(skip(state, message), fields(run_number = message.run_number, instrument = %message.instrument))]
pub async fn handle_data_ready(
    state: &HandlerState,
    message: &mut Message,
) -> Result<Outcome, CoreError> {
    info!("Data ready for processing run");

    let instrument = state
        .directory
        .get_or_create_instrument(&message.instrument)
        .await?;

    let status = if instrument.is_paused {
        state.directory.get_status(Status::Skipped.as_str()).await?
    } else {
        state.directory.get_status(Status::Queued.as_str()).await?
    };

    let experiment = state
        .directory
        .get_or_create_experiment(&message.rb_number.key())
        .await?;
    let run_version = state
        .store
        .latest_version(experiment.id, message.run_number)
        .await?
        + 1;
    message.run_version = Some(run_version);

    let Some(script) = state.scripts.current_script(&instrument.name).await? else {
        warn!("No reduction script found for instrument");
        handle_reduction_error(state, message).await?;
        return Ok(Outcome::NoOp(CoreError::ScriptError {
            instrument: instrument.name,
            details: "no reduction script".to_string(),
        }));
    };

    let run = state
        .store
        .insert_run(&NewReductionRun {
            experiment_id: experiment.id,
            instrument_id: instrument.id,
            run_number: message.run_number,
            run_version,
            run_name: String::new(),
            status,
            script,
            started_by: message.started_by,
        })
        .await?;

    if let Some(data) = message.data.as_deref() {
        state.store.add_data_location(run.id, data).await?;
    }

    debug!("Creating variables for run");
    match state.scripts.variables_for_run(&instrument.name, &run).await {
        Ok(variables) if variables.is_empty() => {
            warn!(run_version, "No instrument variables found for run");
        }
        Ok(variables) => debug!(count = variables.len(), "Variables resolved"),
        Err(e) => warn!(error = %e, "Failed to resolve instrument variables"),
    }

    debug!("Getting script and arguments");
    let (reduction_script, arguments) = script_and_args(state, &instrument.name, &run).await;
    message.reduction_script = Some(reduction_script);
    message.reduction_arguments = Some(arguments);

    if let Some(reason) = is_valid_rb(&message.rb_number) {
        send_skipped(state, message, reason).await?;
        return Ok(Outcome::Applied);
    }

    if instrument.is_paused {
        info!(run_version, "Run has been skipped");
    } else {
        state
            .channel
            .publish(state.queues.tag(Destination::ReductionPending), message)
            .await?;
        info!(run_version, "Run ready for reduction");
    }

    Ok(Outcome::Applied)
}

async fn send_skipped(
    state: &HandlerState,
    message: &mut Message,
    reason: &str,
) -> Result<(), CoreError> {
    warn!(rb_number = %message.rb_number, "Skipping non-integer RB number");
    message.message = Some(format!(
        "Reduction Skipped: {}. Assuming run number to be a calibration run.",
        reason
    ));
    state
        .channel
        .publish(state.queues.tag(Destination::ReductionSkipped), message)
        .await
}

// ============================================================================
// Reduction Started / Complete / Skipped
// ============================================================================

/// Handle a reduction-started message.
///
/// Moves a Queued or Error run to Processing. Any other status is logged as an
/// invalid restart and left alone.
#[instrument(skip(state, message), fields(run_number = message.run_number, run_version = ?message.run_version))]
pub async fn handle_reduction_started(
    state: &HandlerState,
    message: &Message,
) -> Result<Outcome, CoreError> {
    info!("Run has started reduction");

    let Some(mut run) = find_run(state, message).await? else {
        error!(
            rb_number = %message.rb_number,
            "A reduction run started that wasn't found in the database"
        );
        return Ok(Outcome::NoOp(not_found(message)));
    };

    if !run.status.can_start() {
        error!(
            rb_number = %message.rb_number,
            status = %run.status,
            "An invalid attempt to re-start a reduction run was captured"
        );
        return Ok(Outcome::NoOp(invalid_transition(&run, Status::Processing)));
    }

    run.status = state.directory.get_status(Status::Processing.as_str()).await?;
    run.started = Some(Utc::now());
    state.store.save_run(&run).await?;

    Ok(Outcome::Applied)
}

/// Handle a reduction-complete message.
///
/// Moves a Processing run to Completed and records its output locations.
/// Failures are contained and reported as [`Outcome::Failed`].
#[instrument(skip(state, message), fields(run_number = message.run_number, run_version = ?message.run_version))]
pub async fn handle_reduction_complete(
    state: &HandlerState,
    message: &Message,
) -> Result<Outcome, CoreError> {
    info!("Run has completed reduction");

    match complete_run(state, message).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Error completing reduction run");
            Ok(Outcome::Failed(e))
        }
    }
}

async fn complete_run(state: &HandlerState, message: &Message) -> Result<Outcome, CoreError> {
    let Some(mut run) = find_run(state, message).await? else {
        error!(
            rb_number = %message.rb_number,
            "A reduction run completed that wasn't found in the database"
        );
        return Ok(Outcome::NoOp(not_found(message)));
    };

    if !run.status.can_complete() {
        error!(
            rb_number = %message.rb_number,
            status = %run.status,
            "An invalid attempt to complete a reduction run that wasn't processing has been captured"
        );
        return Ok(Outcome::NoOp(invalid_transition(&run, Status::Completed)));
    }

    run.status = state.directory.get_status(Status::Completed.as_str()).await?;
    run.finished = Some(Utc::now());
    copy_logs(&mut run, message);

    if let Some(locations) = &message.reduction_data {
        for location in locations {
            state.store.add_reduction_location(run.id, location).await?;
        }
    }
    state.store.save_run(&run).await?;

    Ok(Outcome::Applied)
}

/// Handle a reduction-skipped message.
///
/// Any existing run is marked Skipped. Skipped runs are never retried.
#[instrument(skip(state, message), fields(run_number = message.run_number, run_version = ?message.run_version))]
pub async fn handle_reduction_skipped(
    state: &HandlerState,
    message: &Message,
) -> Result<Outcome, CoreError> {
    info!(
        reason = message.message.as_deref().unwrap_or("No error message was found"),
        "Run has been skipped"
    );

    let Some(mut run) = find_run(state, message).await? else {
        error!(
            rb_number = %message.rb_number,
            "A reduction run that was skipped could not be found in the database"
        );
        return Ok(Outcome::NoOp(not_found(message)));
    };

    run.status = state.directory.get_status(Status::Skipped.as_str()).await?;
    run.finished = Some(Utc::now());
    copy_logs(&mut run, message);
    state.store.save_run(&run).await?;

    Ok(Outcome::Applied)
}

// ============================================================================
// Reduction Error / Retry
// ============================================================================

/// Handle a reduction-error message.
///
/// Marks the run as Error. When `retry_in` is set and the run has not yet used
/// up its versions, a new version is scheduled for reduction after `retry_in`
/// seconds. Otherwise `retry_in` is cleared on `message`.
#[instrument(skip(state, message), fields(run_number = message.run_number, run_version = ?message.run_version))]
pub async fn handle_reduction_error(
    state: &HandlerState,
    message: &mut Message,
) -> Result<Outcome, CoreError> {
    info!(
        reason = message.message.as_deref().unwrap_or("No error message was found"),
        "Run has encountered an error"
    );

    let Some(mut run) = find_run(state, message).await? else {
        error!(
            rb_number = %message.rb_number,
            "A reduction run that caused an error wasn't found in the database"
        );
        return Ok(Outcome::NoOp(not_found(message)));
    };

    run.status = state.directory.get_status(Status::Error.as_str()).await?;
    run.finished = Some(Utc::now());
    copy_logs(&mut run, message);
    state.store.save_run(&run).await?;

    if let Some(retry_in) = message.retry_in {
        let max_version = state
            .store
            .latest_version(run.experiment_id, run.run_number)
            .await?;

        if max_version <= state.max_retry_version {
            retry_run(state, message.started_by, &run, retry_in).await?;
        } else {
            info!(max_version, "Run has used up its retries");
            message.retry_in = None;
        }
    }

    Ok(Outcome::Applied)
}

/// Schedule a new version of `run` for reduction in `retry_in` seconds.
///
/// Returns the new version, or `None` when the run has been cancelled.
///
/// # Errors
///
/// Returns [`CoreError::RetryPublishFailed`] if the new version was created but
/// could not be queued.
#[instrument(skip(state, run), fields(run_number = run.run_number, run_version = run.run_version))]
pub async fn retry_run(
    state: &HandlerState,
    started_by: Option<i64>,
    run: &ReductionRunRecord,
    retry_in: u64,
) -> Result<Option<ReductionRunRecord>, CoreError> {
    if run.cancel {
        info!("Cancelling run retry");
        return Ok(None);
    }

    info!(retry_in, "Retrying run");

    let delay = Duration::from_secs(retry_in);
    let retry = state
        .store
        .create_retry_version(run, started_by, delay)
        .await?;

    let published = async {
        let message = pending_message(state, &retry).await?;
        state
            .channel
            .publish_delayed(
                state.queues.tag(Destination::ReductionPending),
                &message,
                delay,
            )
            .await
    }
    .await;

    if let Err(e) = published {
        error!(error = %e, retry_version = retry.run_version, "Failed to schedule run retry");
        return Err(CoreError::RetryPublishFailed {
            run_number: retry.run_number,
            run_version: retry.run_version,
            details: e.to_string(),
        });
    }

    Ok(Some(retry))
}

/// Build the reduction-pending message for a stored run.
async fn pending_message(
    state: &HandlerState,
    run: &ReductionRunRecord,
) -> Result<Message, CoreError> {
    let experiment = state
        .directory
        .experiment_by_id(run.experiment_id)
        .await?
        .ok_or_else(|| CoreError::ExperimentNotFound {
            rb_number: format!("id {}", run.experiment_id),
        })?;
    let instrument = state
        .directory
        .instrument_by_id(run.instrument_id)
        .await?
        .ok_or_else(|| CoreError::DatabaseError {
            operation: "instrument_by_id".to_string(),
            details: format!("instrument {} not found", run.instrument_id),
        })?;
    let data = state.store.data_locations(run.id).await?.into_iter().next();
    let (reduction_script, arguments) = script_and_args(state, &instrument.name, run).await;

    Ok(Message {
        run_number: run.run_number,
        run_version: Some(run.run_version),
        rb_number: RbNumber::from_key(&experiment.reference_number),
        instrument: instrument.name,
        data,
        started_by: run.started_by,
        reduction_script: Some(reduction_script),
        reduction_arguments: Some(arguments),
        ..Default::default()
    })
}

// ============================================================================
// Helpers
// ============================================================================

/// Find the run a message refers to.
///
/// The experiment is looked up without being created. Returns `None` when the
/// experiment or the exact (run number, run version) is missing.
pub async fn find_run(
    state: &HandlerState,
    message: &Message,
) -> Result<Option<ReductionRunRecord>, CoreError> {
    let rb_number = message.rb_number.key();
    let Some(experiment) = state.directory.get_experiment(&rb_number).await? else {
        error!(rb_number = %rb_number, "Unable to find experiment");
        return Ok(None);
    };

    let Some(run_version) = message.run_version else {
        error!(rb_number = %rb_number, "Message carries no run version");
        return Ok(None);
    };

    debug!(
        experiment_id = experiment.id,
        run_number = message.run_number,
        run_version,
        "Finding reduction run"
    );
    state
        .store
        .find_run(experiment.id, message.run_number, run_version)
        .await
}

/// Script and arguments for a stored run. Unreadable variables leave the run
/// with empty arguments rather than unqueued.
async fn script_and_args(
    state: &HandlerState,
    instrument: &str,
    run: &ReductionRunRecord,
) -> (String, Value) {
    match state.scripts.script_and_args(instrument, run).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(error = %e, "Failed to resolve reduction arguments, sending none");
            (
                run.script.clone(),
                json!({"standard_vars": {}, "advanced_vars": {}}),
            )
        }
    }
}

fn copy_logs(run: &mut ReductionRunRecord, message: &Message) {
    run.message = message.message.clone();
    run.reduction_log = message.reduction_log.clone();
    run.admin_log = message.admin_log.clone();
}

fn not_found(message: &Message) -> CoreError {
    CoreError::RunNotFound {
        rb_number: message.rb_number.key(),
        run_number: message.run_number,
        run_version: message.run_version.unwrap_or(-1),
    }
}

fn invalid_transition(run: &ReductionRunRecord, to: Status) -> CoreError {
    CoreError::InvalidTransition {
        run_number: run.run_number,
        run_version: run.run_version,
        from: run.status.to_string(),
        to: to.to_string(),
    }
}
