//! Reading kernel-reported execution timestamps out of cell metadata.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::ExecuteTimeError;

/// Cell metadata key holding the execution timing mapping.
pub const EXECUTION_KEY: &str = "execution";

pub const QUEUED_KEY: &str = "iopub.status.busy";
pub const INPUT_KEY: &str = "iopub.execute_input";
pub const STARTED_KEY: &str = "shell.execute_reply.started";
pub const REPLY_KEY: &str = "shell.execute_reply";
pub const FAILED_KEY: &str = "execution_failed";

/// Timestamps derived from an `execution` metadata mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTimes {
    pub queued: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// The completion came from the failure marker.
    pub failed: bool,
    /// A completion without an input echo: the kernel never ran the cell.
    pub likely_aborted: bool,
}

impl ExecutionTimes {
    pub fn from_metadata(execution: &Map<String, Value>) -> Result<Self, ExecuteTimeError> {
        let queued = read_timestamp(execution, QUEUED_KEY)?;
        let input = read_timestamp(execution, INPUT_KEY)?;
        let started = read_timestamp(execution, STARTED_KEY)?.or(input);
        let reply = read_timestamp(execution, REPLY_KEY)?;
        let failure = read_timestamp(execution, FAILED_KEY)?;

        Ok(Self {
            queued,
            started,
            ended: reply.or(failure),
            failed: failure.is_some(),
            likely_aborted: (reply.is_some() || failure.is_some()) && input.is_none(),
        })
    }
}

/// The `execution` mapping of a cell's metadata, if it is an object.
pub fn execution_map(metadata: &Map<String, Value>) -> Option<&Map<String, Value>> {
    metadata.get(EXECUTION_KEY).and_then(Value::as_object)
}

/// Whether an `execution` mapping carries the failure marker.
pub fn has_failure_marker(execution: &Map<String, Value>) -> bool {
    execution.get(FAILED_KEY).is_some_and(|v| !v.is_null())
}

/// Parse a Jupyter timestamp. Strings without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn read_timestamp(
    execution: &Map<String, Value>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, ExecuteTimeError> {
    match execution.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            parse_timestamp(s)
                .map(Some)
                .ok_or_else(|| ExecuteTimeError::InvalidTimestamp {
                    key: key.to_string(),
                    value: s.clone(),
                })
        }
        Some(other) => Err(ExecuteTimeError::UnexpectedMetadata {
            key: key.to_string(),
            value: other.clone(),
        }),
    }
}
