use axum::{ http::StatusCode, response::{ IntoResponse, Response }, Json };
use serde::Serialize;
use thiserror::Error;

use crate::llm::chat::ProviderError;

/// Failures that end a relay request before its event stream opens.
/// Once streaming has begun, failures travel as `error` events instead.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed request: {0}")]
    InvalidRequest(String),
    #[error("Relay is not configured: {0}")]
    Configuration(String),
    #[error("Too many requests, please slow down")]
    RateLimited,
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::MissingApiKey(_) | ProviderError::Config(_) => {
                RelayError::Configuration(err.to_string())
            }
            other => RelayError::Provider(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
