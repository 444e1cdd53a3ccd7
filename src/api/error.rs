//! Mapping of service errors onto HTTP responses.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::Error;

/// JSON error body: `{"error": <title>, "message": <detail>}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Anything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Service(Error),
    RateLimited { retry_after: Duration },
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Service(err)
    }
}

impl ApiError {
    fn status_and_title(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
            ApiError::Service(err) if err.is_unavailable() => match err {
                Error::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "Record Store Unavailable"),
                _ => (StatusCode::SERVICE_UNAVAILABLE, "Search Unavailable"),
            },
            ApiError::Service(err) => match err {
                Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
                Error::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, title) = self.status_and_title();
        let message = match &self {
            ApiError::RateLimited { retry_after } => format!(
                "rate limit exceeded, retry in {} s",
                retry_after.as_secs().max(1)
            ),
            ApiError::Service(err) => {
                if status.is_server_error() {
                    error!("Request failed: {}", err);
                }
                err.to_string()
            }
        };

        let body = ErrorBody {
            error: title.to_string(),
            message,
        };
        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs().max(1).to_string();
            if let Ok(value) = HeaderValue::from_str(&secs) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
