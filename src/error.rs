use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::ScenarioStatus;

pub type Result<T> = std::result::Result<T, PlannerError>;

/// Errors surfaced by the forecasting and scenario services
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Missing or invalid request fields; raised before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// A collaborator call timed out or failed
    #[error("Upstream {source_name} unavailable: {reason}")]
    UpstreamUnavailable { source_name: String, reason: String },

    /// Store read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Lifecycle transition attempted from the wrong state; nothing was changed
    #[error("Scenario {id} is {current}, cannot move to {attempted}")]
    StateConflict {
        id: Uuid,
        current: ScenarioStatus,
        attempted: ScenarioStatus,
    },

    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl PlannerError {
    pub fn upstream(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(reason: impl ToString) -> Self {
        Self::Persistence(reason.to_string())
    }

    /// HTTP status a caller-facing layer should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StateConflict { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Stable error kind string
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            Self::Persistence(_) => "PersistenceError",
            Self::StateConflict { .. } => "StateConflict",
            Self::NotFound(_) => "NotFound",
        }
    }
}

impl From<validator::ValidationErrors> for PlannerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        PlannerError::Validation(errors.to_string())
    }
}

#[cfg(feature = "db")]
impl From<sqlx::Error> for PlannerError {
    fn from(error: sqlx::Error) -> Self {
        PlannerError::Persistence(format!("Database error: {}", error))
    }
}

impl From<serde_json::Error> for PlannerError {
    fn from(error: serde_json::Error) -> Self {
        PlannerError::Persistence(format!("Serialization error: {}", error))
    }
}
