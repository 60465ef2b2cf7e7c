use serde_json::Value;
use thiserror::Error;

/// Error taxonomy surfaced on the control protocol.
///
/// Expected lifecycle conditions (a child exiting, a build failing) are
/// recorded on the app runtime and reported through per-app results; this
/// enum is for dispatch-level refusals and invalid requests.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        message: String,
        details: Option<Value>,
    },

    #[error("configuration is busy: {0}")]
    Busy(String),

    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    #[error("build failed with exit code {exit_code}: {tail}")]
    BuildFailed { exit_code: i32, tail: String },

    #[error("startup failed: {reason}")]
    StartupFailed { reason: String },

    #[error("no handler registered for app type '{0}'")]
    HandlerMissing(String),

    #[error("command dispatch failed with exit code {exit_code}")]
    CommandFailed { exit_code: i32 },

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl Error {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
            details: None,
        }
    }

    /// Wrap an unexpected failure with a fresh correlation id and log it.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(correlation_id = %correlation_id, error = %err, "internal error");
        Self::Internal {
            correlation_id,
            message: err.to_string(),
        }
    }

    /// Wire code for the control protocol's `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::Busy(_) => "busy",
            Self::PortUnavailable(_) => "port_unavailable",
            Self::BuildFailed { .. } => "build_failed",
            Self::StartupFailed { .. } => "startup_failed",
            Self::HandlerMissing(_) => "handler_missing",
            Self::CommandFailed { .. } => "command_failed",
            Self::Internal { .. } => "internal",
        }
    }

    /// Structured payload for `error.details`, where the kind carries one.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ConfigInvalid { details, .. } => details.clone(),
            Self::BuildFailed { exit_code, tail } => Some(serde_json::json!({
                "exit_code": exit_code,
                "tail": tail,
            })),
            Self::StartupFailed { reason } => Some(serde_json::json!({ "reason": reason })),
            Self::CommandFailed { exit_code } => {
                Some(serde_json::json!({ "exit_code": exit_code }))
            }
            Self::Internal { correlation_id, .. } => {
                Some(serde_json::json!({ "correlation_id": correlation_id }))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
