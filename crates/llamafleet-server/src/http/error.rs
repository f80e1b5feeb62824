//! Maps the core's error enums to HTTP status codes (spec §6 status contract, §7
//! error-handling design). Every response body is `{"error": "..."}"`, matching the
//! OpenAI-compatible error shape expected by chat-completions clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llamafleet_registry::{RegistryError, SupervisorError, ValidationError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Errors surfaced by the HTTP layer: wraps the core's [`RegistryError`] plus the
/// routing-specific kinds named in spec §4.4 / §6.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("request body is missing a `model` field")]
    MissingModel,
    #[error("no instance named `{0}`")]
    UnknownModel(String),
    #[error("instance `{0}` did not become ready within the configured deadline")]
    ReadinessTimeout(String),
    #[error("upstream connection failed: {0}")]
    UpstreamConnection(#[source] reqwest::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Registry(e) => (registry_status(e), e.to_string()),
            ApiError::MissingModel => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::UnknownModel(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::ReadinessTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::UpstreamConnection(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::AlreadyExists(_) => StatusCode::CONFLICT,
        RegistryError::DeleteWhileRunning(_) => StatusCode::CONFLICT,
        RegistryError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::StartInProgress(_) => StatusCode::CONFLICT,
        RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
        RegistryError::Supervisor(s) => supervisor_status(s),
    }
}

fn supervisor_status(e: &SupervisorError) -> StatusCode {
    match e {
        SupervisorError::AlreadyRunning | SupervisorError::NotRunning => StatusCode::CONFLICT,
        SupervisorError::NoOptions => StatusCode::BAD_REQUEST,
        SupervisorError::Spawn(_) | SupervisorError::LogFile(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SupervisorError::Validation(v) => validation_status(v),
    }
}

fn validation_status(_: &ValidationError) -> StatusCode {
    StatusCode::BAD_REQUEST
}
