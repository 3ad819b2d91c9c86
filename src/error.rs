use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::{fetch::FetchError, transcode::TranscodeError, upstream::UpstreamError};

#[derive(Debug, Serialize)]
struct Diagnostic {
    message: String,
    error: String,
}

/// Error type returned by every handler. Validation failures carry a client
/// status; everything else maps to a 500. The body is empty unless the
/// endpoint opts into a JSON diagnostic (the playlist endpoint does).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub cause: Option<String>,
    diagnostic_body: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            cause: None,
            diagnostic_body: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            cause: None,
            diagnostic_body: false,
        }
    }

    /// Serialize this error as a small JSON body instead of an empty one.
    pub fn diagnostic(mut self) -> Self {
        self.diagnostic_body = true;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(
                status = %self.status,
                message = %self.message,
                cause = ?self.cause,
                "request failed"
            );
        }

        if self.diagnostic_body {
            let error = self.cause.unwrap_or_else(|| self.message.clone());
            (
                self.status,
                Json(Diagnostic {
                    message: self.message,
                    error,
                }),
            )
                .into_response()
        } else {
            self.status.into_response()
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(error: UpstreamError) -> Self {
        let message = match &error {
            UpstreamError::Connect(_) => "could not reach the archive",
            UpstreamError::Timeout { .. } => "archive download timed out",
            UpstreamError::Transfer { .. } => "archive transfer failed",
            UpstreamError::WorkerGone => "archive worker is unavailable",
        };

        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
            cause: Some(error.to_string()),
            diagnostic_body: false,
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Upstream(upstream) => upstream.into(),
            FetchError::Filesystem { .. } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "local filesystem failure".to_string(),
                cause: Some(error.to_string()),
                diagnostic_body: false,
            },
        }
    }
}

impl From<TranscodeError> for ApiError {
    fn from(error: TranscodeError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "video transcode failed".to_string(),
            cause: Some(error.to_string()),
            diagnostic_body: false,
        }
    }
}
