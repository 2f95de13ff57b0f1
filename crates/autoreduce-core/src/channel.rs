// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message channel abstractions.
//!
//! [`MessageChannel`] is the publish side used by the lifecycle handlers.
//! [`MessageSource`] is the consume side used by the queue consumer. The
//! database backends implement both over a `queue_messages` table where a
//! delayed publish is simply a row whose `deliver_at` lies in the future.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::message::Message;

/// A message waiting in the queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedMessage {
    /// Database primary key. Doubles as delivery order for equal `deliver_at`.
    pub id: i64,
    /// Destination tag.
    pub destination: String,
    /// JSON encoded [`Message`].
    pub payload: String,
    /// Earliest delivery time.
    pub deliver_at: DateTime<Utc>,
    /// When the message was published.
    pub created_at: DateTime<Utc>,
}

/// Publish-only side of the queue.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publish for immediate delivery.
    async fn publish(&self, destination: &str, message: &Message) -> Result<(), CoreError> {
        self.publish_delayed(destination, message, Duration::ZERO)
            .await
    }

    /// Publish for delivery no earlier than `delay` from now.
    async fn publish_delayed(
        &self,
        destination: &str,
        message: &Message,
        delay: Duration,
    ) -> Result<(), CoreError>;
}

/// Consume side of the queue.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages on any of `destinations` whose delivery time has passed,
    /// oldest first.
    async fn fetch_due(
        &self,
        destinations: &[String],
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, CoreError>;

    /// Remove a delivered message.
    async fn ack(&self, id: i64) -> Result<(), CoreError>;
}

/// Delivery time for a message published now with `delay`.
pub(crate) fn deliver_at(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
