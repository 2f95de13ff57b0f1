// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Destination routing for lifecycle messages.
//!
//! Decodes a queued payload, picks the handler for its destination tag and
//! contains every failure so the consumer can move on to the next message.

use tracing::{debug, error, instrument, warn};

use crate::channel::QueuedMessage;
use crate::error::CoreError;
use crate::handlers::{
    HandlerState, Outcome, handle_data_ready, handle_reduction_complete,
    handle_reduction_error, handle_reduction_skipped, handle_reduction_started,
};
use crate::message::{Destination, Message};

/// What happened to a delivered message.
#[derive(Debug, Clone)]
pub enum Dispatched {
    /// A handler ran to completion.
    Handled(Outcome),
    /// No handler consumes the destination tag.
    Unroutable,
    /// The payload could not be decoded or is missing required fields.
    Rejected(CoreError),
    /// The handler returned an error.
    Failed(CoreError),
}

impl Dispatched {
    /// Whether the consumer must surface this result instead of moving on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Dispatched::Failed(e) if e.is_fatal())
    }
}

/// Route a queued message to its handler.
pub async fn dispatch(state: &HandlerState, queued: &QueuedMessage) -> Dispatched {
    dispatch_payload(state, &queued.destination, &queued.payload).await
}

/// Route a raw payload published to `destination`.
#[instrument(skip(state, payload))]
pub async fn dispatch_payload(state: &HandlerState, destination: &str, payload: &str) -> Dispatched {
    let route = match state.queues.resolve(destination) {
        Some(d) if Destination::CONSUMED.contains(&d) => d,
        _ => {
            warn!("Received message on unrecognised destination, dropping");
            return Dispatched::Unroutable;
        }
    };

    let mut message = match Message::from_json(payload).and_then(|m| {
        m.validate(route)?;
        Ok(m)
    }) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Rejected malformed lifecycle message");
            return Dispatched::Rejected(e);
        }
    };

    debug!(?route, run_number = message.run_number, "Dispatching lifecycle message");

    let result = match route {
        Destination::DataReady => handle_data_ready(state, &mut message).await,
        Destination::ReductionStarted => handle_reduction_started(state, &message).await,
        Destination::ReductionComplete => handle_reduction_complete(state, &message).await,
        Destination::ReductionError => handle_reduction_error(state, &mut message).await,
        Destination::ReductionSkipped => handle_reduction_skipped(state, &message).await,
        Destination::ReductionPending => return Dispatched::Unroutable,
    };

    match result {
        Ok(outcome) => Dispatched::Handled(outcome),
        Err(e) => {
            error!(
                error = %e,
                code = e.error_code(),
                fatal = e.is_fatal(),
                run_number = message.run_number,
                run_version = ?message.run_version,
                rb_number = %message.rb_number,
                "Handler failed"
            );
            Dispatched::Failed(e)
        }
    }
}
