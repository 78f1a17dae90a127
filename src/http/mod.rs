//! HTTP types for the relay endpoint.

mod request;
mod response;

pub use request::{generate_request_id, FetchRequest};
pub use response::{RelayResponse, StatusCode};
