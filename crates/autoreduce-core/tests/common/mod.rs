// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for autoreduce-core integration tests.
//!
//! Provides TestContext wiring a persistence backend, a script directory and a
//! queue consumer together, plus helpers that play the part of the reduction
//! workers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use autoreduce_core::channel::{MessageChannel, MessageSource};
use autoreduce_core::config::QueueNames;
use autoreduce_core::consumer::{QueueConsumer, QueueConsumerConfig};
use autoreduce_core::handlers::HandlerState;
use autoreduce_core::message::{Destination, Message, RbNumber};
use autoreduce_core::migrations;
use autoreduce_core::persistence::{
    Directory, PostgresPersistence, ReductionRunRecord, RunStore, SqlitePersistence,
};
use autoreduce_core::script::FsScriptResolver;

/// Instruments with a reduction script in the test script directory.
pub const INSTRUMENTS: [&str; 2] = ["WISH", "GEM"];

/// Test context that manages the backend, scripts and consumer.
pub struct TestContext<P> {
    pub persistence: Arc<P>,
    pub consumer: QueueConsumer,
    pub queues: QueueNames,
    pub scripts_dir: TempDir,
}

impl TestContext<SqlitePersistence> {
    /// Create a context over an in-memory SQLite database.
    pub async fn sqlite() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        Self::build(SqlitePersistence::new(pool), QueueNames::default())
    }

    /// Every message on `destination`, due or not, with its delivery time.
    pub async fn scheduled(&self, destination: Destination) -> Vec<(Message, DateTime<Utc>)> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT payload, deliver_at FROM queue_messages WHERE destination = ? ORDER BY id",
        )
        .bind(self.queues.tag(destination))
        .fetch_all(self.persistence.pool())
        .await
        .expect("Failed to read queue");

        rows.into_iter()
            .map(|(payload, at)| (Message::from_json(&payload).unwrap(), at))
            .collect()
    }
}

impl TestContext<PostgresPersistence> {
    /// Create a context over the database in TEST_DATABASE_URL.
    ///
    /// Destination tags are unique per context so tests sharing the database
    /// never see each other's messages.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = sqlx::PgPool::connect(&database_url).await.ok()?;
        migrations::run_postgres(&pool).await.ok()?;

        let prefix = format!("/test/{}", unique_suffix());
        let queues = QueueNames {
            data_ready: format!("{}/DataReady", prefix),
            reduction_started: format!("{}/ReductionStarted", prefix),
            reduction_complete: format!("{}/ReductionComplete", prefix),
            reduction_error: format!("{}/ReductionError", prefix),
            reduction_skipped: format!("{}/ReductionSkipped", prefix),
            reduction_pending: format!("{}/ReductionPending", prefix),
        };

        Some(Self::build(PostgresPersistence::new(pool), queues))
    }
}

impl<P> TestContext<P>
where
    P: Directory + RunStore + MessageChannel + MessageSource + 'static,
{
    fn build(persistence: P, queues: QueueNames) -> Self {
        let scripts_dir = tempfile::tempdir().expect("Failed to create script dir");
        for instrument in INSTRUMENTS {
            let dir = scripts_dir.path().join(instrument);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("reduce.py"),
                format!("def main(input_file, output_dir):\n    print('{}')\n", instrument),
            )
            .unwrap();
        }
        std::fs::write(
            scripts_dir.path().join("WISH").join("reduce_vars.json"),
            r#"{"standard_vars": {"sum_runs": false}, "advanced_vars": {"focus": 5}}"#,
        )
        .unwrap();

        let persistence = Arc::new(persistence);
        let state = HandlerState::new(
            persistence.clone(),
            persistence.clone(),
            Arc::new(FsScriptResolver::new(format!(
                "{}/{{instrument}}",
                scripts_dir.path().display()
            ))),
            persistence.clone(),
        )
        .with_queues(queues.clone());

        let consumer = QueueConsumer::new(
            persistence.clone(),
            Arc::new(state),
            QueueConsumerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
            },
        );

        Self {
            persistence,
            consumer,
            queues,
            scripts_dir,
        }
    }

    /// Publish a message for immediate delivery.
    pub async fn publish(&self, destination: Destination, message: &Message) {
        self.persistence
            .publish(self.queues.tag(destination), message)
            .await
            .expect("Failed to publish");
    }

    /// Run the consumer until no due messages are left.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = self
                .consumer
                .process_batch()
                .await
                .expect("Failed to process batch");
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    /// Take every due message on `destination`, the way a reduction worker would.
    pub async fn take(&self, destination: Destination) -> Vec<Message> {
        let queued = self
            .persistence
            .fetch_due(&[self.queues.tag(destination).to_string()], 100)
            .await
            .expect("Failed to fetch messages");

        let mut messages = Vec::new();
        for q in queued {
            self.persistence.ack(q.id).await.unwrap();
            messages.push(Message::from_json(&q.payload).unwrap());
        }
        messages
    }

    /// Look up a run by RB number, run number and version.
    pub async fn find_run(
        &self,
        rb_number: &str,
        run_number: i64,
        run_version: i32,
    ) -> Option<ReductionRunRecord> {
        let experiment = self.persistence.get_experiment(rb_number).await.unwrap()?;
        self.persistence
            .find_run(experiment.id, run_number, run_version)
            .await
            .unwrap()
    }

    /// Reduction output paths of a run.
    pub async fn reduction_locations(&self, run: &ReductionRunRecord) -> Vec<String> {
        self.persistence.reduction_locations(run.id).await.unwrap()
    }
}

/// Suffix unique to this process and moment.
pub fn unique_suffix() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

/// A unique positive RB number.
pub fn unique_rb() -> i64 {
    1_000_000 + (Utc::now().timestamp_micros() % 1_000_000_000).abs()
}

/// Data-ready message for `instrument`.
pub fn data_ready(instrument: &str, rb_number: impl Into<RbNumber>, run_number: i64) -> Message {
    Message {
        run_number,
        rb_number: rb_number.into(),
        instrument: instrument.to_string(),
        data: Some(format!(
            "/isis/NDX{0}/Instrument/data/cycle_21_1/{0}{1:08}.nxs",
            instrument, run_number
        )),
        started_by: Some(-1),
        ..Default::default()
    }
}

/// Copy of `pending` as a worker would send it back.
pub fn reply(pending: &Message) -> Message {
    Message {
        reduction_script: None,
        reduction_arguments: None,
        ..pending.clone()
    }
}

/// Skip the test when TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
