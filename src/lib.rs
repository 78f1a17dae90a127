//! # tlsrelay - TLS-fingerprinting fetch relay
//!
//! tlsrelay is a small HTTP service with a single endpoint, `POST /fetch`.
//! It takes a target URL plus client arguments and performs one outbound
//! GET through a TLS-fingerprint-spoofing client. The upstream result is
//! relayed back to the caller, bounded by a fixed deadline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Request Gateway (POST /fetch)                │
//! │         decode {url, args} ─► invoke ─► encode result        │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Bounded Fetch Invoker                     │
//! │   open session ─► GET vs. deadline ─► close session (once)   │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │              FingerprintClient (e.g. CycleTLS)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tlsrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let client = CycleTlsClient::new(CycleTlsConfig::from_env());
//!     let server = RelayServer::new(RelayConfig::new().port(3000), Arc::new(client));
//!     server.run().await
//! }
//! ```
//!
//! ## Sessions
//!
//! Every request opens its own session with the client and closes it
//! exactly once, whether the GET succeeds, fails or runs past the deadline.
//! Requests share no state, so concurrent requests cannot interfere.

pub mod fetch;
pub mod http;
pub mod runtime;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::fetch::{
        BoundedInvoker, CycleTlsClient, CycleTlsConfig, FetchError, FingerprintClient,
        FingerprintSession,
    };
    pub use crate::http::{FetchRequest, RelayResponse, StatusCode};
    pub use crate::runtime::{RelayConfig, RelayServer};
    pub use async_trait::async_trait;
}

// Re-export for convenience
pub use fetch::{BoundedInvoker, FetchError, FingerprintClient, FingerprintSession};
pub use http::{FetchRequest, RelayResponse};
pub use runtime::{RelayConfig, RelayServer};
