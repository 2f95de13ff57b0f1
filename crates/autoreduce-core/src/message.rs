// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle messages exchanged over the queue.
//!
//! A [`Message`] is the wire record carried by every lifecycle destination. The
//! destination tag decides which handler consumes it, see [`Destination`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Logical queue a message is published to or consumed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// New data is available for a run.
    DataReady,
    /// A reduction worker started a run.
    ReductionStarted,
    /// A reduction worker finished a run.
    ReductionComplete,
    /// A reduction worker failed a run.
    ReductionError,
    /// A run will not be reduced.
    ReductionSkipped,
    /// A run is waiting for a reduction worker. Produced, never consumed here.
    ReductionPending,
}

impl Destination {
    /// Destinations consumed by the lifecycle handler.
    pub const CONSUMED: [Destination; 5] = [
        Destination::DataReady,
        Destination::ReductionStarted,
        Destination::ReductionComplete,
        Destination::ReductionError,
        Destination::ReductionSkipped,
    ];
}

/// RB (experiment) number as it appears on the wire.
///
/// Producers send either a JSON number or a string, and strings are not
/// guaranteed to be numeric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RbNumber {
    /// Numeric RB number.
    Integer(i64),
    /// RB number sent as text.
    Text(String),
}

impl RbNumber {
    /// Integer value, if the RB number is numeric.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RbNumber::Integer(n) => Some(*n),
            RbNumber::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Key used to look up the experiment. Numeric values are normalised so
    /// that `7` and `"7"` refer to the same experiment.
    pub fn key(&self) -> String {
        match (self, self.as_integer()) {
            (_, Some(n)) => n.to_string(),
            (RbNumber::Text(s), None) => s.trim().to_string(),
            (RbNumber::Integer(n), None) => n.to_string(),
        }
    }

    /// Rebuild an RB number from a stored experiment key.
    pub fn from_key(key: &str) -> Self {
        key.parse()
            .map(RbNumber::Integer)
            .unwrap_or_else(|_| RbNumber::Text(key.to_string()))
    }
}

impl Default for RbNumber {
    fn default() -> Self {
        RbNumber::Text(String::new())
    }
}

impl fmt::Display for RbNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RbNumber::Integer(n) => write!(f, "{}", n),
            RbNumber::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RbNumber {
    fn from(value: i64) -> Self {
        RbNumber::Integer(value)
    }
}

impl From<i32> for RbNumber {
    fn from(value: i32) -> Self {
        RbNumber::Integer(value.into())
    }
}

impl From<&str> for RbNumber {
    fn from(value: &str) -> Self {
        RbNumber::Text(value.to_string())
    }
}

/// Check an RB number.
///
/// Returns `None` when the value is an integer greater than zero, otherwise a
/// reason suitable for a skip message.
pub fn is_valid_rb(rb_number: &RbNumber) -> Option<&'static str> {
    match rb_number.as_integer() {
        Some(n) if n > 0 => None,
        Some(_) => Some("RB Number is less than or equal to 0"),
        None => Some("RB Number is a string"),
    }
}

/// Longest retry delay a reduction worker may ask for, in seconds (30 days).
pub const MAX_RETRY_IN_SECS: u64 = 30 * 24 * 60 * 60;

/// Instrument names become a path component of the script directory.
fn is_plain_name(name: &str) -> bool {
    name != "." && !name.contains("..") && !name.contains(['/', '\\', '\0'])
}

/// Lifecycle message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Run number of the data file.
    pub run_number: i64,
    /// Version of the reduction run. Assigned by data_ready.
    #[serde(default)]
    pub run_version: Option<i32>,
    /// Experiment business key.
    pub rb_number: RbNumber,
    /// Instrument name.
    #[serde(default)]
    pub instrument: String,
    /// Input data file path (data_ready only).
    #[serde(default)]
    pub data: Option<String>,
    /// Last status note.
    #[serde(default)]
    pub message: Option<String>,
    /// Reduction output log.
    #[serde(default)]
    pub reduction_log: String,
    /// Admin log.
    #[serde(default)]
    pub admin_log: String,
    /// Paths of reduced output files.
    #[serde(default)]
    pub reduction_data: Option<Vec<String>>,
    /// Reduction script text, attached for the reduction worker.
    #[serde(default)]
    pub reduction_script: Option<String>,
    /// Reduction arguments, attached for the reduction worker.
    #[serde(default)]
    pub reduction_arguments: Option<serde_json::Value>,
    /// Seconds to wait before retrying a failed reduction. `None` means no retry.
    #[serde(default)]
    pub retry_in: Option<u64>,
    /// User that triggered the reduction.
    #[serde(default)]
    pub started_by: Option<i64>,
}

impl Message {
    /// Decode a message from its JSON payload.
    pub fn from_json(payload: &str) -> Result<Self, CoreError> {
        serde_json::from_str(payload).map_err(|e| CoreError::ValidationError {
            field: "payload".to_string(),
            message: e.to_string(),
        })
    }

    /// Encode the message as JSON.
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the fields the handler for `destination` relies on.
    pub fn validate(&self, destination: Destination) -> Result<(), CoreError> {
        if let Some(retry_in) = self.retry_in.filter(|secs| *secs > MAX_RETRY_IN_SECS) {
            return Err(CoreError::ValidationError {
                field: "retry_in".to_string(),
                message: format!(
                    "retry_in of {}s exceeds the maximum of {}s",
                    retry_in, MAX_RETRY_IN_SECS
                ),
            });
        }

        match destination {
            Destination::DataReady => {
                if self.instrument.trim().is_empty() {
                    return Err(CoreError::ValidationError {
                        field: "instrument".to_string(),
                        message: "instrument is required".to_string(),
                    });
                }
                if !is_plain_name(&self.instrument) {
                    return Err(CoreError::ValidationError {
                        field: "instrument".to_string(),
                        message: format!("'{}' is not a valid instrument name", self.instrument),
                    });
                }
                if self.data.as_deref().is_none_or(|d| d.is_empty()) {
                    return Err(CoreError::ValidationError {
                        field: "data".to_string(),
                        message: "data location is required".to_string(),
                    });
                }
            }
            Destination::ReductionPending => {}
            _ => {
                if self.run_version.is_none() {
                    return Err(CoreError::ValidationError {
                        field: "run_version".to_string(),
                        message: "run_version is required".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
