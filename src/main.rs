//! tlsrelay server binary.
//!
//! Serves `POST /fetch` on port 3000 using the CycleTLS helper found at
//! `CYCLETLS_PATH`.

use std::sync::Arc;
use tlsrelay::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting tlsrelay...");

    let client_config = CycleTlsConfig::from_env();
    tracing::info!(
        "Using CycleTLS helper: {}",
        client_config.executable.display()
    );

    let config = RelayConfig::new().host("0.0.0.0").port(3000);
    let server = RelayServer::new(config, Arc::new(CycleTlsClient::new(client_config)));

    tracing::info!(
        "Try: curl -X POST -H 'Content-Type: application/json' \
         -d '{{\"url\":\"https://example.com\",\"args\":{{}}}}' http://localhost:3000/fetch"
    );

    server.run().await
}
