//! Error types for the execute-time core.

/// Errors raised on the render and lifecycle paths.
///
/// None of these are fatal to the host: the tracker logs them and carries on
/// with the remaining cells.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteTimeError {
    /// A code-typed cell model has no realized cell view.
    #[error("Could not find code cell for model: {0}")]
    MissingCodeCell(String),

    /// A timestamp key held a string that is not an ISO-8601 timestamp.
    #[error("Invalid timestamp for '{key}': {value:?}")]
    InvalidTimestamp { key: String, value: String },

    /// A timestamp key held something other than a string.
    #[error("Unexpected value for '{key}': expected a timestamp string, got {value}")]
    UnexpectedMetadata {
        key: String,
        value: serde_json::Value,
    },

    /// A notebook document could not be turned into cells.
    #[error("Invalid notebook document: {0}")]
    InvalidNotebook(String),
}
