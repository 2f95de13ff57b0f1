// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autoreduce Core - Reduction Run Lifecycle Handler
//!
//! This crate drives reduction runs of an auto-reduction pipeline through their
//! lifecycle. It consumes lifecycle messages from a durable queue, keeps the
//! run records in PostgreSQL or SQLite, and schedules retries of failed runs as
//! new run versions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                       ┌──────────────────────┐
//! │   Data Ingestion     │  /queue/DataReady     │  Reduction Workers   │
//! │  (run detection)     │──────────┐   ┌────────│  (script execution)  │
//! └──────────────────────┘          │   │        └──────────────────────┘
//!                                   ▼   ▼ Started/Complete/Error/Skipped ▲
//!                         ┌─────────────────────┐                       │
//!                         │    queue_messages   │── /queue/ReductionPending
//!                         └──────────┬──────────┘
//!                                    │ poll
//!                                    ▼
//!                         ┌─────────────────────┐
//!                         │   QueueConsumer     │
//!                         │  dispatch → handler │
//!                         └──────────┬──────────┘
//!                                    │
//!                                    ▼
//!                         ┌─────────────────────┐
//!                         │ PostgreSQL / SQLite │
//!                         └─────────────────────┘
//! ```
//!
//! # Destinations
//!
//! | Destination | Direction | Handler |
//! |-------------|-----------|---------|
//! | `/queue/DataReady` | consumed | [`handlers::handle_data_ready`] |
//! | `/queue/ReductionStarted` | consumed | [`handlers::handle_reduction_started`] |
//! | `/queue/ReductionComplete` | consumed | [`handlers::handle_reduction_complete`] |
//! | `/queue/ReductionError` | consumed | [`handlers::handle_reduction_error`] |
//! | `/queue/ReductionSkipped` | consumed, produced | [`handlers::handle_reduction_skipped`] |
//! | `/queue/ReductionPending` | produced | - |
//!
//! # Run Status State Machine
//!
//! ```text
//!      data_ready                       data_ready (paused instrument)
//!          │                                       │
//!          ▼                                       ▼
//!     ┌─────────┐      skipped            ┌─────────┐
//!     │ QUEUED  │────────────────────────►│ SKIPPED │
//!     └────┬────┘                         └─────────┘
//!          │ started                           ▲
//!          ▼                                   │ skipped
//!     ┌────────────┐ ─────────────────────────-┘
//!     │ PROCESSING │
//!     └──┬──────┬──┘
//!  complete     error
//!        │      │
//!        ▼      ▼
//! ┌───────────┐ ┌───────┐  retry_in set, version ≤ 4
//! │ COMPLETED │ │ ERROR │──────────────────────────► new version, QUEUED
//! └───────────┘ └───────┘
//! ```
//!
//! Run versions start at 0 and each retry adds one, so a run is attempted at
//! most six times.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTOREDUCE_DATABASE_URL` | Yes | - | `postgres://` or `sqlite:` connection string |
//! | `AUTOREDUCE_SCRIPTS_DIR` | No | `/isis/NDX{instrument}/user/scripts/autoreduction` | Script directory template |
//! | `AUTOREDUCE_POLL_INTERVAL_MS` | No | `1000` | Queue poll interval |
//! | `AUTOREDUCE_BATCH_SIZE` | No | `10` | Messages per poll |
//! | `AUTOREDUCE_MAX_RETRY_VERSION` | No | `4` | Highest version that is still retried |
//! | `AUTOREDUCE_QUEUE_*` | No | `/queue/...` | Destination tags |
//!
//! # Modules
//!
//! - [`channel`]: Publish and consume traits for the queue
//! - [`config`]: Configuration from environment variables
//! - [`consumer`]: Polling queue consumer
//! - [`dispatch`]: Destination routing
//! - [`error`]: Error types with error code mapping
//! - [`handlers`]: Lifecycle handlers and retry policy
//! - [`message`]: Lifecycle message record and RB number validation
//! - [`migrations`]: Embedded database migrations
//! - [`persistence`]: Directory and run store traits with SQLite/PostgreSQL backends
//! - [`script`]: Reduction script resolution
//! - [`status`]: Run status values

#![deny(missing_docs)]

/// Publish and consume traits for the lifecycle queue.
pub mod channel;

/// Configuration loaded from environment variables.
pub mod config;

/// Polling consumer feeding due messages to the dispatcher.
pub mod consumer;

/// Routing of destination tags to lifecycle handlers.
pub mod dispatch;

/// Error types for lifecycle processing with error code mapping.
pub mod error;

/// Lifecycle handlers (data ready, started, complete, skipped, error).
pub mod handlers;

/// Lifecycle message record.
pub mod message;

/// Embedded database migrations.
pub mod migrations;

/// Persistence traits and backends.
pub mod persistence;

/// Reduction script resolution.
pub mod script;

/// Reduction run status values.
pub mod status;

pub use consumer::{QueueConsumer, QueueConsumerConfig};
pub use error::CoreError;
pub use handlers::{HandlerState, Outcome};
pub use message::Message;
pub use status::Status;
