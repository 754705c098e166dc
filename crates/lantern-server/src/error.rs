use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lantern_control_plane::{
    ErrorBody, Phase, ERROR_CONFLICT, ERROR_FORBIDDEN_ORIGIN, ERROR_MALFORMED_REQUEST,
    ERROR_NOT_FOUND, ERROR_UNAUTHORIZED,
};
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("transition not allowed for device {device_id} in phase {phase}")]
    Conflict { device_id: String, phase: Phase },
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),
    #[error("teardown failed: {0}")]
    TeardownFailed(String),
    #[error("missing or invalid api key")]
    Unauthorized,
    #[error("origin not allowed: {0}")]
    ForbiddenOrigin(String),
    #[error("unknown device {0}")]
    NotFound(String),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::ProvisionFailed(_) | Self::TeardownFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ForbiddenOrigin(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => ERROR_CONFLICT,
            Self::MalformedRequest(_) => ERROR_MALFORMED_REQUEST,
            Self::ProvisionFailed(_) => "provision_failed",
            Self::TeardownFailed(_) => "teardown_failed",
            Self::Unauthorized => ERROR_UNAUTHORIZED,
            Self::ForbiddenOrigin(_) => ERROR_FORBIDDEN_ORIGIN,
            Self::NotFound(_) => ERROR_NOT_FOUND,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "control request failed");
        } else {
            warn!(error = %self, "control request rejected");
        }
        (status, Json(ErrorBody::new(self.code(), self.to_string()))).into_response()
    }
}
