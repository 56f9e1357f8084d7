use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown field '{0}' for this schema")]
    UnknownField(String),

    #[error("no outcome strategy applies: {0}")]
    OutcomeUnresolvable(String),

    #[error("malformed condition: {0}")]
    MalformedCondition(String),

    #[error("guardrails failed: {}", .0.join(", "))]
    GuardrailFailed(Vec<String>),

    #[error("concurrent deployment in progress: {0}")]
    ConcurrencyConflict(String),

    #[error("rollback unavailable: {0}")]
    RollbackUnavailable(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    guardrails: Vec<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_)
            | ServiceError::UnknownField(_)
            | ServiceError::OutcomeUnresolvable(_)
            | ServiceError::MalformedCondition(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::GuardrailFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::ConcurrencyConflict(_) | ServiceError::RollbackUnavailable(_) => {
                StatusCode::CONFLICT
            }
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if matches!(self, ServiceError::Internal(_) | ServiceError::Config(_)) {
            error!(error = %self, "request failed");
        }

        let guardrails = match &self {
            ServiceError::GuardrailFailed(names) => names.clone(),
            _ => Vec::new(),
        };

        let body = ErrorBody {
            error: self.to_string(),
            guardrails,
        };
        (status, Json(body)).into_response()
    }
}
