// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue consumer.
//!
//! Periodically polls the queue for due messages on the lifecycle destinations
//! and dispatches them one at a time, in delivery order. Every delivered
//! message is acknowledged once dispatch returns, whatever the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::channel::MessageSource;
use crate::dispatch::{Dispatched, dispatch};
use crate::error::CoreError;
use crate::handlers::HandlerState;

/// Queue consumer configuration.
#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    /// How often to poll for due messages
    pub poll_interval: Duration,
    /// Maximum messages to process per poll
    pub batch_size: i64,
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
        }
    }
}

/// Queue consumer that runs as a background task.
pub struct QueueConsumer {
    source: Arc<dyn MessageSource>,
    state: Arc<HandlerState>,
    config: QueueConsumerConfig,
    subscriptions: Vec<String>,
    shutdown: Arc<Notify>,
    processing: Arc<AtomicBool>,
}

impl QueueConsumer {
    /// Create a consumer subscribed to the lifecycle destinations of `state`.
    pub fn new(
        source: Arc<dyn MessageSource>,
        state: Arc<HandlerState>,
        config: QueueConsumerConfig,
    ) -> Self {
        let subscriptions = state.queues.subscriptions();
        Self {
            source,
            state,
            config,
            subscriptions,
            shutdown: Arc::new(Notify::new()),
            processing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Whether a batch is being processed right now.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Run the consumer loop.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            subscriptions = ?self.subscriptions,
            "Queue consumer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Queue consumer shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_batch().await {
                        error!(error = %e, "Failed to poll queue");
                    }
                }
            }
        }
    }

    /// Dispatch one batch of due messages. Returns how many were consumed.
    pub async fn process_batch(&self) -> Result<usize, CoreError> {
        let messages = self
            .source
            .fetch_due(&self.subscriptions, self.config.batch_size)
            .await?;

        if messages.is_empty() {
            debug!("No messages due");
            return Ok(0);
        }

        self.processing.store(true, Ordering::SeqCst);
        let result = self.consume(&messages).await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn consume(&self, messages: &[crate::channel::QueuedMessage]) -> Result<usize, CoreError> {
        for queued in messages {
            let result = dispatch(&self.state, queued).await;
            match &result {
                Dispatched::Handled(outcome) => {
                    debug!(id = queued.id, destination = %queued.destination, ?outcome, "Message handled");
                }
                Dispatched::Failed(e) if result.is_fatal() => {
                    error!(
                        id = queued.id,
                        destination = %queued.destination,
                        payload = %queued.payload,
                        error = %e,
                        "Fatal handler failure, message will not be redelivered"
                    );
                }
                _ => {}
            }
            self.source.ack(queued.id).await?;
        }
        Ok(messages.len())
    }
}
