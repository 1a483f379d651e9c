//! Turn error types

use crate::db::DbError;
use std::time::Duration;
use thiserror::Error;

/// Why a turn failed. None of these are retried inside the runner.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The tool could not be started at all
    #[error("failed to launch claude: {0}")]
    LaunchFailure(#[source] std::io::Error),

    /// The invocation ran past its budget and was killed
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The caller went away; the process was killed
    #[error("request cancelled")]
    Cancelled,

    /// The terminal record was missing or unreadable
    #[error("malformed output from claude: {0}")]
    MalformedTerminalOutput(String),

    /// Non-zero exit without a terminal record
    #[error("claude exited with {}: {stderr}", .code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    ProcessFailed { code: Option<i32>, stderr: String },

    /// The tool finished but reported failure (auth expired, usage limit, ...)
    #[error("Claude returned error: {0}")]
    ToolReportedFailure(String),

    /// Another turn on this conversation held the lock for too long
    #[error("timed out after {}s waiting for the previous turn on this conversation", .0.as_secs())]
    LockTimeout(Duration),

    /// Session store failure
    #[error("session store error: {0}")]
    Store(#[from] DbError),
}

impl TurnError {
    /// Short machine-readable kind, used in logs and error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LaunchFailure(_) => "launch_failure",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::MalformedTerminalOutput(_) => "malformed_output",
            Self::ProcessFailed { .. } => "process_failed",
            Self::ToolReportedFailure(_) => "tool_error",
            Self::LockTimeout(_) => "lock_timeout",
            Self::Store(_) => "store_error",
        }
    }
}
