//! Fetch error type.

use crate::http::{RelayResponse, StatusCode};

/// Every way a `/fetch` call can fail.
///
/// All variants are flattened into a `{"error": message}` body at the
/// gateway. Only malformed input is distinguished by status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request body did not decode into a usable fetch request.
    MalformedInput(String),
    /// The fingerprinting client failed to open a session.
    Acquisition(String),
    /// The outbound GET failed inside the client.
    Upstream(String),
    /// The outbound GET did not finish before the deadline.
    Timeout,
}

impl FetchError {
    pub fn malformed(message: impl Into<String>) -> Self {
        FetchError::MalformedInput(message.into())
    }

    pub fn acquisition(message: impl Into<String>) -> Self {
        FetchError::Acquisition(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        FetchError::Upstream(message.into())
    }

    /// HTTP status the gateway answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            FetchError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::MalformedInput(message)
            | FetchError::Acquisition(message)
            | FetchError::Upstream(message) => write!(f, "{}", message),
            FetchError::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<FetchError> for RelayResponse {
    fn from(err: FetchError) -> Self {
        RelayResponse::error(err.status(), err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::malformed(format!("Invalid request body: {}", err))
    }
}
