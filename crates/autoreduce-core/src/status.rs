// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reduction run status values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a reduction run.
///
/// ```text
///   data_ready ──► QUEUED ──started──► PROCESSING ──complete──► COMPLETED
///        │           ▲                     │
///        │ paused    └──── started ──── ERROR ◄──error──┘
///        ▼                                 │
///     SKIPPED ◄──────── skipped ───────────┘ (any status)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Waiting for a reduction worker.
    Queued,
    /// Not reduced (paused instrument, invalid RB number, or skipped by the worker).
    Skipped,
    /// A reduction worker picked the run up.
    Processing,
    /// Reduction finished successfully.
    Completed,
    /// Reduction failed. May be retried as a new run version.
    Error,
}

impl Status {
    /// Name stored in the database and shown to operators.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "Queued",
            Status::Skipped => "Skipped",
            Status::Processing => "Processing",
            Status::Completed => "Completed",
            Status::Error => "Error",
        }
    }

    /// Whether a reduction-started message may move a run in this status to
    /// [`Status::Processing`]. Error is accepted so a rerun of a failed version
    /// can be picked up.
    pub fn can_start(self) -> bool {
        matches!(self, Status::Queued | Status::Error)
    }

    /// Whether a reduction-complete message may move a run in this status to
    /// [`Status::Completed`].
    pub fn can_complete(self) -> bool {
        self == Status::Processing
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reduction status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Status::Queued),
            "Skipped" => Ok(Status::Skipped),
            "Processing" => Ok(Status::Processing),
            "Completed" => Ok(Status::Completed),
            "Error" => Ok(Status::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for Status {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, UnknownStatus> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_name() {
        for status in [
            Status::Queued,
            Status::Skipped,
            Status::Processing,
            Status::Completed,
            Status::Error,
        ] {
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
    }

    #[test]
    fn test_unknown_status() {
        let err = "Running".parse::<Status>().unwrap_err();
        assert_eq!(err.to_string(), "unknown reduction status 'Running'");
        // Names are case sensitive
        assert!("queued".parse::<Status>().is_err());
    }

    #[test]
    fn test_try_from_column_value() {
        assert_eq!(Status::try_from("Error".to_string()), Ok(Status::Error));
        assert_eq!(
            Status::try_from("Cancelled".to_string()),
            Err(UnknownStatus("Cancelled".to_string()))
        );
    }

    #[test]
    fn test_start_guard() {
        assert!(Status::Queued.can_start());
        assert!(Status::Error.can_start());
        assert!(!Status::Processing.can_start());
        assert!(!Status::Completed.can_start());
        assert!(!Status::Skipped.can_start());
    }

    #[test]
    fn test_complete_guard() {
        assert!(Status::Processing.can_complete());
        assert!(!Status::Queued.can_complete());
        assert!(!Status::Error.can_complete());
    }
}
