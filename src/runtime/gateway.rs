//! Translates a `/fetch` body into an invoker call and back.

use crate::fetch::{BoundedInvoker, FetchError};
use crate::http::{FetchRequest, RelayResponse};
use tracing::{error, info, warn};

/// Handle one `/fetch` body.
///
/// Malformed input answers 400 without opening a session. Every other
/// failure answers 500 with `{"error": message}`. On success the client's
/// value is relayed as JSON without reshaping.
pub async fn handle(body: &[u8], invoker: &BoundedInvoker) -> RelayResponse {
    let request = match FetchRequest::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected malformed request: {}", e);
            return e.into();
        }
    };

    info!("Received request for URL: {}", request.url);

    match invoker.invoke(&request.url, &request.args).await {
        Ok(value) => RelayResponse::json(&value)
            .unwrap_or_else(|e| FetchError::upstream(e.to_string()).into()),
        Err(e) => {
            error!("Error occurred: {}", e);
            e.into()
        }
    }
}
