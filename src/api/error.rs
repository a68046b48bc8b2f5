use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::bridge::BridgeError;
use crate::orchestrator::OrchestratorError;
use crate::session::RegistryError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 404 - Generic not-found.
    NotFound,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 503 - The server is draining connections.
    ShuttingDown,
    /// 500 - Catch-all internal error.
    InternalError(String),
    /// Failure reported by the session layer.
    Session(OrchestratorError),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Session(e) => session_status(e),
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::NotFound => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::InternalError(_) => "internal_error",
            ApiError::Session(e) => e.code(),
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header or ?token= query parameter.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
            ApiError::Session(e) => e.to_string(),
        }
    }
}

fn session_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::Registry(e) => match e {
            RegistryError::CircuitBreakerOpen { .. } | RegistryError::CreationRateExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RegistryError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RegistryError::SessionClosed(_) | RegistryError::SuspensionExpired(_) => StatusCode::GONE,
            RegistryError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
        },
        OrchestratorError::Bridge(e) => match e {
            BridgeError::InvalidDimensions { .. }
            | BridgeError::InvalidEnvKey(_)
            | BridgeError::AssistantUnavailable => StatusCode::BAD_REQUEST,
            BridgeError::ProcessGone => StatusCode::GONE,
            BridgeError::Shell(_) | BridgeError::Pty(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        OrchestratorError::NoProcess(_) => StatusCode::GONE,
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError::Session(e)
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Session(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code().is_server_error() {
            tracing::error!(code = self.code(), message = %self.message(), "request failed");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
