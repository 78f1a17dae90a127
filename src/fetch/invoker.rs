//! Bounded single-shot fetch through a fingerprinting session.

use crate::fetch::client::{FingerprintClient, FingerprintSession};
use crate::fetch::FetchError;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default ceiling on a single GET.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Performs exactly one GET per call, bounded by a deadline.
///
/// Each call opens its own session, so concurrent calls never share
/// client state.
#[derive(Clone)]
pub struct BoundedInvoker {
    client: Arc<dyn FingerprintClient>,
    deadline: Duration,
}

impl BoundedInvoker {
    /// Create an invoker with the default 10 second deadline.
    pub fn new(client: Arc<dyn FingerprintClient>) -> Self {
        Self {
            client,
            deadline: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Get the deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Get the client name.
    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Open a session, GET `url` with `args`, and close the session.
    ///
    /// The deadline starts once the session is open. If it fires first the
    /// pending GET is dropped and [`FetchError::Timeout`] is returned.
    pub async fn invoke(&self, url: &str, args: &Map<String, Value>) -> Result<Value, FetchError> {
        let session = match self.client.open().await {
            Ok(session) => session,
            Err(e @ FetchError::Acquisition(_)) => return Err(e),
            Err(other) => return Err(FetchError::Acquisition(other.to_string())),
        };
        let guard = SessionGuard::new(session, self.client.name());

        let outcome = match tokio::time::timeout(self.deadline, guard.get(url, args)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Request timed out for URL: {}", url);
                Err(FetchError::Timeout)
            }
        };

        guard.release().await;
        outcome
    }
}

/// Owns an open session and guarantees it is closed exactly once.
///
/// [`SessionGuard::release`] closes the session in place. If the guard is
/// dropped unreleased (the request future was cancelled or panicked) the
/// close is spawned onto the current runtime instead.
pub struct SessionGuard {
    session: Option<Box<dyn FingerprintSession>>,
    client_name: String,
}

impl SessionGuard {
    pub fn new(session: Box<dyn FingerprintSession>, client_name: impl Into<String>) -> Self {
        Self {
            session: Some(session),
            client_name: client_name.into(),
        }
    }

    /// Issue the GET on the guarded session.
    pub async fn get(&self, url: &str, args: &Map<String, Value>) -> Result<Value, FetchError> {
        self.session().get(url, args).await
    }

    // Only `release` and `drop` take the session, and both end the guard.
    fn session(&self) -> &dyn FingerprintSession {
        self.session
            .as_deref()
            .expect("session is held until the guard is released")
    }

    /// Close the session and consume the guard.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            debug!("Released {} session", self.client_name);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Releasing abandoned {} session", self.client_name);
                handle.spawn(async move { session.close().await });
            }
            Err(_) => warn!(
                "No runtime available to release {} session",
                self.client_name
            ),
        }
    }
}
