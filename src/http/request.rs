//! Inbound fetch request decoded from the `POST /fetch` body.

use crate::fetch::FetchError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// A request to fetch `url` through the fingerprinting client.
///
/// `args` is handed to the client untouched. Its recognised keys (headers,
/// proxy, cookies, ja3, ...) are defined entirely by the client.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FetchRequest {
    /// Target URL.
    #[serde(default)]
    pub url: String,
    /// Opaque client arguments.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl FetchRequest {
    /// Create a new FetchRequest with no arguments.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            args: Map::new(),
        }
    }

    /// Add a client argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Decode and validate a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, FetchError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::malformed("Request body is empty"));
        }

        let request: FetchRequest = serde_json::from_slice(body)?;
        if request.url.trim().is_empty() {
            return Err(FetchError::malformed("Missing required field: url"));
        }

        Ok(request)
    }
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique request ID.
pub fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", timestamp, seq)
}
