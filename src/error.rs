use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid required field in a client request.
    #[error("{0}")]
    Validation(String),
    /// The messaging platform call failed; nothing is retried.
    #[error("upstream delivery failed: {0}")]
    UpstreamDelivery(String),
    /// Store read/write/parse failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamDelivery(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Error::Validation(message) => message.clone(),
            Error::UpstreamDelivery(_) => {
                "Message delivery failed, please try again later".to_string()
            }
            Error::Storage(_) => "Storage error, please try again later".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(json!({ "success": false, "error": self.public_message() })),
        )
            .into_response()
    }
}
