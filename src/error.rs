use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure classes for the service. Every handler converts into one of these
/// and every variant renders as a structured JSON response, so no request is
/// ever left without a definitive answer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("not a decodable image: {0}")]
    InvalidImage(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("vision backend error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("image encode error: {0}")]
    Encode(#[from] image::ImageError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidImage(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) | ApiError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        } else {
            tracing::warn!("request rejected: {self}");
        }
        let body = Json(json!({ "status": "ERROR", "message": self.to_string() }));
        (status, body).into_response()
    }
}
