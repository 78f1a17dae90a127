//! Bounded fetches through a TLS-fingerprinting client.

pub mod client;
pub mod cycletls;
pub mod error;
pub mod invoker;

pub use client::{FingerprintClient, FingerprintSession};
pub use cycletls::{CycleTlsClient, CycleTlsConfig};
pub use error::FetchError;
pub use invoker::{BoundedInvoker, SessionGuard, DEFAULT_FETCH_TIMEOUT};
