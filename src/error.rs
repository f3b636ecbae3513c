use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;
use crate::backend::BackendError;
use crate::models::Envelope;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(err) => err.status(),
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream { .. } | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Status { status, message } => AppError::Upstream { status, message },
            other => AppError::Upstream {
                status: 502,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        (status, Json(Envelope::error(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(AppError::from(AuthError::Expired).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::from(AuthError::Forbidden).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::bad_request("reason is required").status(), StatusCode::BAD_REQUEST);

        let upstream = AppError::from(BackendError::Status {
            status: 404,
            message: "Application not found".to_string(),
        });
        assert_eq!(upstream.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(upstream.to_string(), "Application not found");
    }
}
