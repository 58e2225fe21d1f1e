//! API error mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use audio_helper_core::error::AudioHelperError;

/// Error returned by request handlers, rendered as an OpenAI-style error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Stable error label from [`AudioHelperError::kind`].
    pub code: &'static str,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
            code: "invalid_input",
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
            code: "other",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    _ => "server_error",
                },
                "code": self.code,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<AudioHelperError> for ApiError {
    fn from(err: AudioHelperError) -> Self {
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(err.kind());

        let status = if err.is_client_error() {
            warn!(kind = err.kind(), error = %err, "Rejected request");
            StatusCode::BAD_REQUEST
        } else {
            error!(kind = err.kind(), error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
            code: err.kind(),
        }
    }
}
