//! Error Types
//!
//! One taxonomy for every operation the engine exposes. Each variant maps to a
//! stable [`ErrorCode`] and an HTTP status so the operations API and the CLI
//! report failures the same way.

use serde::Serialize;

use crate::gateway::GatewayError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by lifecycle, sync, ingest and read operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Unknown instance or conversation.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Gateway timed out or could not be reached. Retryable by the caller.
    #[error("gateway unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Gateway returned a definitive error. Not retryable.
    #[error("gateway rejected request ({status}): {body}")]
    UpstreamRejected { status: u16, body: String },

    /// Webhook secret missing or wrong.
    #[error("webhook authentication failed")]
    AuthenticationFailed,

    /// A full sync is already running for the instance.
    #[error("{0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Machine-readable error codes returned in API error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    UpstreamUnavailable,
    UpstreamRejected,
    AuthenticationFailed,
    Conflict,
    InvalidInput,
    StorageFailure,
}

impl SyncError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
            Self::UpstreamRejected { .. } => ErrorCode::UpstreamRejected,
            Self::AuthenticationFailed => ErrorCode::AuthenticationFailed,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Storage(_) => ErrorCode::StorageFailure,
        }
    }

    /// HTTP status the operations API answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::UpstreamUnavailable(_) => 503,
            Self::UpstreamRejected { .. } => 502,
            Self::AuthenticationFailed => 401,
            Self::Conflict(_) => 409,
            Self::InvalidInput(_) => 400,
            Self::Storage(_) => 500,
        }
    }

    /// The gateway answered that the instance does not exist upstream.
    pub fn is_upstream_instance_missing(&self) -> bool {
        matches!(self, Self::UpstreamRejected { status: 404, .. })
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::Conflict(_) | Self::Storage(_)
        )
    }
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable { message } => Self::UpstreamUnavailable(message),
            GatewayError::Rejected { status, body } => Self::UpstreamRejected { status, body },
            // A 2xx we cannot parse is a gateway contract violation, not a
            // transient outage.
            GatewayError::Decode { message } => Self::UpstreamRejected {
                status: 200,
                body: message,
            },
            GatewayError::InvalidInstanceName(name) => {
                Self::InvalidInput(format!("invalid instance name: {:?}", name))
            }
        }
    }
}
