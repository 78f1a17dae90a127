//! Fingerprinting client capability traits.

use crate::fetch::FetchError;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A client that performs outbound HTTP while emulating a TLS fingerprint.
///
/// The relay never looks inside the client. It opens one session per
/// request, issues a single GET on it and closes it again.
#[async_trait]
pub trait FingerprintClient: Send + Sync {
    /// Open a fresh session. Failures should be reported as
    /// [`FetchError::Acquisition`].
    async fn open(&self) -> Result<Box<dyn FingerprintSession>, FetchError>;

    /// Get the client name.
    fn name(&self) -> &str;
}

/// A live session owned by exactly one request.
#[async_trait]
pub trait FingerprintSession: Send + Sync {
    /// Issue a GET for `url`. `args` is passed through as received.
    async fn get(&self, url: &str, args: &Map<String, Value>) -> Result<Value, FetchError>;

    /// Tear the session down. Called exactly once.
    async fn close(self: Box<Self>);
}
