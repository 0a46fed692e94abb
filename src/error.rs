//! Error types for race control.
//!
//! Errors are split by how the engine reacts to them:
//!
//! - **Configuration errors** fail fast when events are built and the event never starts
//! - **Telemetry errors** abort the running sequence at the task boundary
//! - **Chat errors** are logged by the coordination layer and the sequence carries on
//! - **Task failures** are panics or faults caught by the supervisor for one task
//!
//! Cancellation is not represented here. It is a [`Wake`](crate::coordination::Wake)
//! value observed at every suspension point.
//!
//! ```rust
//! use racecontrol::RaceControlError;
//!
//! let error = RaceControlError::config("collisions_per_penalty", "no penalty configured");
//! assert!(!error.is_retryable());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for race control operations.
pub type Result<T, E = RaceControlError> = std::result::Result<T, E>;

/// Main error type for race control operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RaceControlError {
    #[error("Invalid configuration for '{field}': {reason}")]
    Config { field: String, reason: String },

    #[error("Telemetry unavailable: {reason}")]
    Telemetry {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Chat send failed for '{text}': {reason}")]
    Chat { text: String, reason: String },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("File error: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task '{task}' failed: {details}")]
    TaskFailed { task: String, details: String },
}

impl RaceControlError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RaceControlError::Config { .. } => false,
            RaceControlError::Telemetry { .. } => true,
            RaceControlError::Chat { .. } => true,
            RaceControlError::Parse { .. } => false,
            RaceControlError::Io { .. } => false,
            RaceControlError::TaskFailed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            RaceControlError::Config { .. } => vec![
                "Check the event configuration for missing or contradictory values",
                "Make sure every penalty threshold has a matching penalty",
                "Verify window bounds are ordered (min_start <= max_start)",
            ],
            RaceControlError::Telemetry { .. } => vec![
                "Ensure iRacing is running and in a session",
                "Check the telemetry provider connection",
                "Restart the race control supervisor",
            ],
            RaceControlError::Chat { .. } => vec![
                "Make sure the iRacing window can receive chat input",
                "Verify the admin account still has race control rights",
                "Send the command manually if it was critical",
            ],
            RaceControlError::Parse { .. } => vec![
                "Check the YAML syntax of the configuration file",
                "Compare field names against the documented configuration",
            ],
            RaceControlError::Io { .. } => vec![
                "Check the file exists and is readable",
                "Check file permissions",
            ],
            RaceControlError::TaskFailed { .. } => vec![
                "Inspect the logs for the failing event",
                "Clear a stuck busy flag with force_clear_busy if no caution is running",
            ],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RaceControlError::Config { field: field.into(), reason: reason.into() }
    }

    /// Helper constructor for telemetry read failures.
    pub fn telemetry_unavailable(reason: impl Into<String>) -> Self {
        RaceControlError::Telemetry { reason: reason.into(), source: None }
    }

    /// Helper constructor for telemetry read failures with source.
    pub fn telemetry_unavailable_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        RaceControlError::Telemetry { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for chat failures.
    pub fn chat_failed(text: impl Into<String>, reason: impl Into<String>) -> Self {
        RaceControlError::Chat { text: text.into(), reason: reason.into() }
    }

    /// Helper constructor for parse failures.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        RaceControlError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        RaceControlError::Io { path, source }
    }

    /// Helper constructor for task failures.
    pub fn task_failed(task: impl Into<String>, details: impl Into<String>) -> Self {
        RaceControlError::TaskFailed { task: task.into(), details: details.into() }
    }
}

impl From<serde_yaml_ng::Error> for RaceControlError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        RaceControlError::Parse { context: "YAML".to_string(), details: err.to_string() }
    }
}
