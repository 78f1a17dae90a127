//! Relay runtime: HTTP server, gateway and configuration.

mod config;
pub mod gateway;
mod server;

pub use config::RelayConfig;
pub use server::RelayServer;
